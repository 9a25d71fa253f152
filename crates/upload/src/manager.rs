//! Upload manager: owns every session, admits them under the concurrency
//! budget and dispatches their chunks.
//!
//! All mutable state sits behind one mutex that is never held across an
//! `.await`. Chunk tasks run detached and report back under that mutex,
//! which is where every counter changes.

use std::collections::VecDeque;
use std::num::NonZeroU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use uplink_protocol::{ChunkFailure, CurrentUpload, UploadSnapshot, UploadStatus};
use uplink_transfer::ChunkPlan;

use crate::config::UploadConfig;
use crate::error::{ConfigError, UploadError};
use crate::ingest::{self, Selection};
use crate::session::UploadSession;
use crate::transport::{ChunkTransport, TransportError};
use crate::types::{FileDescriptor, UploadEvent};
use crate::worker::{self, ChunkJob, ChunkOutcome};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Runs resumable chunked uploads.
///
/// Commands take effect synchronously: when `cancel` returns, the slot is
/// already free and the next queued file already admitted. Methods that
/// start chunk transfers must be called from within a Tokio runtime.
pub struct UploadManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: UploadConfig,
    default_chunk_size: NonZeroU64,
    transport: Arc<dyn ChunkTransport>,
    state: Mutex<State>,
    snapshot_tx: watch::Sender<UploadSnapshot>,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<UploadEvent>>>,
}

#[derive(Default)]
struct State {
    /// Sessions in enqueue order, keyed by name.
    sessions: IndexMap<String, UploadSession>,
    /// Admission queue of `queued` sessions.
    queue: VecDeque<String>,
    /// Sessions currently `uploading`.
    active: usize,
    /// Most recently progressed uploading file.
    current: Option<String>,
    closed: bool,
}

impl State {
    fn session_for(&mut self, job: &ChunkJob) -> Option<&mut UploadSession> {
        self.sessions
            .get_mut(&job.file_name)
            .filter(|s| s.id() == job.session_id)
    }

    fn session_mut(&mut self, name: &str) -> Result<&mut UploadSession, UploadError> {
        self.sessions
            .get_mut(name)
            .ok_or_else(|| UploadError::UnknownSession(name.to_string()))
    }

    fn names_with(&self, status: UploadStatus) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.status() == status)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl UploadManager {
    /// Creates a manager sending chunks through `transport`.
    pub fn new(
        config: UploadConfig,
        transport: Arc<dyn ChunkTransport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let default_chunk_size = config.default_chunk_size()?;
        let (snapshot_tx, _) = watch::channel(UploadSnapshot::default());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                default_chunk_size,
                transport,
                state: Mutex::new(State::default()),
                snapshot_tx,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        })
    }

    pub fn config(&self) -> &UploadConfig {
        &self.shared.config
    }

    /// Takes the event receiver (can only be called once).
    pub fn take_events(&self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.shared
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Current aggregate view.
    pub fn snapshot(&self) -> UploadSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    /// Receiver notified on every transition and progress change.
    pub fn subscribe(&self) -> watch::Receiver<UploadSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    pub fn status(&self, name: &str) -> Option<UploadStatus> {
        self.shared.lock().sessions.get(name).map(|s| s.status())
    }

    /// Ingests `selection` and enqueues the resulting files.
    pub async fn upload(&self, selection: Selection) -> Result<Vec<String>, UploadError> {
        let files = ingest::collect_async(selection).await?;
        self.enqueue(files)
    }

    /// Creates one `queued` session per file and runs admission.
    ///
    /// Returns the assigned names. A name already held by a live session is
    /// suffixed (`a.txt` → `a.txt (1)`); a terminal session with the same
    /// name is replaced. Nothing is enqueued if any file cannot be planned.
    pub fn enqueue(&self, files: Vec<FileDescriptor>) -> Result<Vec<String>, UploadError> {
        let shared = &self.shared;
        let plans = files
            .iter()
            .map(|f| {
                ChunkPlan::new(
                    f.size(),
                    f.chunk_size().unwrap_or(shared.default_chunk_size),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut guard = shared.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(UploadError::ShutDown);
        }

        let mut names = Vec::with_capacity(files.len());
        for (mut file, plan) in files.into_iter().zip(plans) {
            let name = unique_name(&state.sessions, file.name());
            if state.sessions.shift_remove(&name).is_some() {
                debug!(file = %name, "replacing finished upload");
            }
            file.rename(name.clone());

            info!(
                file = %name,
                size = plan.total_size(),
                chunks = plan.total_chunks(),
                "upload queued"
            );
            let session = UploadSession::new(Uuid::new_v4().to_string(), file, plan);
            state.sessions.insert(name.clone(), session);
            state.queue.push_back(name.clone());
            shared.emit_status(&name, UploadStatus::Queued);
            names.push(name);
        }

        shared.admit(state);
        shared.publish(state);
        Ok(names)
    }

    /// Pauses an uploading file and hands its slot to the next queued one.
    pub fn pause(&self, name: &str) -> Result<(), UploadError> {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        shared.pause_session(state, name)?;
        shared.admit(state);
        shared.publish(state);
        Ok(())
    }

    /// Resumes a paused file, or puts it at the front of the queue when no
    /// slot is free.
    pub fn resume(&self, name: &str) -> Result<(), UploadError> {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        if !shared.resume_session(state, name)? {
            state.queue.push_front(name.to_string());
        }
        shared.publish(state);
        Ok(())
    }

    /// Cancels a queued, uploading or paused file.
    pub fn cancel(&self, name: &str) -> Result<(), UploadError> {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        shared.cancel_session(state, name)?;
        shared.admit(state);
        shared.publish(state);
        Ok(())
    }

    /// Pauses every uploading file. Queued files stay queued and are not
    /// admitted into the freed slots. Returns how many were paused.
    pub fn pause_all(&self) -> usize {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        let names = state.names_with(UploadStatus::Uploading);
        for name in &names {
            if let Err(e) = shared.pause_session(state, name) {
                warn!(file = %name, error = %e, "pause failed");
            }
        }
        shared.publish(state);
        names.len()
    }

    /// Resumes every paused file in enqueue order, then runs admission.
    /// Returns how many were resumed or requeued.
    pub fn resume_all(&self) -> usize {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        let names = state.names_with(UploadStatus::Paused);
        let mut waiting = Vec::new();
        for name in &names {
            match shared.resume_session(state, name) {
                Ok(true) => {}
                Ok(false) => waiting.push(name.clone()),
                Err(e) => warn!(file = %name, error = %e, "resume failed"),
            }
        }
        for name in waiting.into_iter().rev() {
            state.queue.push_front(name);
        }
        shared.admit(state);
        shared.publish(state);
        names.len()
    }

    /// Cancels every non-terminal file. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        let cancelled = shared.cancel_everything(state);
        shared.publish(state);
        cancelled
    }

    /// Alias of [`pause`](Self::pause).
    pub fn pause_upload(&self, name: &str) -> Result<(), UploadError> {
        self.pause(name)
    }

    /// Alias of [`resume`](Self::resume).
    pub fn resume_upload(&self, name: &str) -> Result<(), UploadError> {
        self.resume(name)
    }

    /// Alias of [`cancel`](Self::cancel).
    pub fn cancel_upload(&self, name: &str) -> Result<(), UploadError> {
        self.cancel(name)
    }

    /// Alias of [`pause_all`](Self::pause_all).
    pub fn pause_all_uploads(&self) -> usize {
        self.pause_all()
    }

    /// Alias of [`resume_all`](Self::resume_all).
    pub fn resume_all_uploads(&self) -> usize {
        self.resume_all()
    }

    /// Alias of [`cancel_all`](Self::cancel_all).
    pub fn cancel_all_uploads(&self) -> usize {
        self.cancel_all()
    }

    /// Removes a finished file from the snapshot.
    pub fn forget(&self, name: &str) -> Result<(), UploadError> {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        let session = state.session_mut(name)?;
        if !session.status().is_terminal() {
            return Err(UploadError::InvalidTransition {
                name: name.to_string(),
                from: session.status(),
                command: "forget",
            });
        }
        state.sessions.shift_remove(name);
        shared.publish(state);
        Ok(())
    }

    /// Resolves once nothing is queued or uploading.
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(UploadSnapshot::is_idle).await;
    }

    /// Cancels everything, clears the snapshot and rejects further enqueues.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let state = &mut *guard;
        if state.closed {
            return;
        }
        let cancelled = shared.cancel_everything(state);
        state.sessions.clear();
        state.current = None;
        state.closed = true;
        info!(cancelled, "upload manager shut down");
        shared.publish(state);
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: UploadEvent) {
        // A slow consumer loses events rather than stalling uploads.
        let _ = self.events_tx.try_send(event);
    }

    fn emit_status(&self, name: &str, status: UploadStatus) {
        self.emit(UploadEvent::StatusChanged {
            name: name.to_string(),
            status,
        });
    }

    fn publish(&self, state: &State) {
        debug_assert_eq!(
            state.active,
            state
                .sessions
                .values()
                .filter(|s| s.status() == UploadStatus::Uploading)
                .count()
        );

        let per_file = state
            .sessions
            .iter()
            .map(|(name, s)| (name.clone(), s.progress()))
            .collect();
        let current = state
            .current
            .as_ref()
            .and_then(|name| state.sessions.get(name))
            .map(|s| CurrentUpload {
                file_name: s.name().to_string(),
                progress: s.progress_percent(),
            });

        self.snapshot_tx.send_replace(UploadSnapshot {
            per_file,
            global_uploading: state.active > 0,
            current,
        });
    }

    /// Admits queued sessions while session slots are free.
    fn admit(self: &Arc<Self>, state: &mut State) {
        while state.active < self.config.max_parallel_sessions {
            let Some(name) = state.queue.pop_front() else {
                break;
            };
            let Some(session) = state.sessions.get_mut(&name) else {
                continue;
            };
            let Ok(completed) = session.admit() else {
                continue;
            };
            debug!(
                file = %name,
                queued_ms = session.queued_for().as_millis() as u64,
                "upload admitted"
            );
            self.started(state, &name, completed);
        }
    }

    /// Bookkeeping after a session entered a run via admit or resume.
    fn started(self: &Arc<Self>, state: &mut State, name: &str, completed: bool) {
        if completed {
            info!(file = %name, "upload completed");
            self.emit_status(name, UploadStatus::Completed);
            return;
        }
        state.active += 1;
        if state.current.is_none() {
            state.current = Some(name.to_string());
        }
        info!(file = %name, "upload started");
        self.emit_status(name, UploadStatus::Uploading);
        self.dispatch(state, name);
    }

    /// Clears `current` when `name` stops uploading.
    fn stopped(&self, state: &mut State, name: &str) {
        if state.current.as_deref() == Some(name) {
            state.current = state
                .sessions
                .iter()
                .find(|(_, s)| s.status() == UploadStatus::Uploading)
                .map(|(n, _)| n.clone());
        }
    }

    /// Spawns chunk tasks until the session's chunk budget is used up.
    fn dispatch(self: &Arc<Self>, state: &mut State, name: &str) {
        let Some(session) = state.sessions.get_mut(name) else {
            return;
        };
        while let Some(ticket) = session.next_chunk(self.config.max_parallel_chunks) {
            let job = ChunkJob {
                session_id: session.id().to_string(),
                file_name: name.to_string(),
                total_chunks: session.plan().total_chunks(),
                total_size: session.plan().total_size(),
                spec: ticket.spec,
                epoch: ticket.epoch,
                prior_attempts: ticket.failed_attempts,
                content: Arc::clone(session.content()),
                cancel: ticket.cancel,
            };
            debug!(file = %name, chunk = job.spec.index, offset = job.spec.offset, "chunk dispatched");

            let shared = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = worker::run_chunk(
                    &job,
                    shared.transport.as_ref(),
                    &shared.config.retry,
                    shared.config.chunk_timeout,
                    |attempt, err| shared.on_attempt_failed(&job, attempt, err),
                )
                .await;
                shared.on_chunk_done(&job, outcome);
            });
        }
    }

    fn on_attempt_failed(&self, job: &ChunkJob, attempt: u32, err: &TransportError) {
        let mut state = self.lock();
        let Some(session) = state.session_for(job) else {
            return;
        };
        session.on_attempt_failed(job.spec.index);
        if attempt < self.config.retry.max_attempts {
            self.emit(UploadEvent::ChunkRetry {
                name: job.file_name.clone(),
                chunk_index: job.spec.index,
                attempt,
                error: err.to_string(),
            });
        }
    }

    /// Applies a chunk task's final report.
    fn on_chunk_done(self: &Arc<Self>, job: &ChunkJob, outcome: ChunkOutcome) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let name = job.file_name.as_str();
        let index = job.spec.index;
        let Some(session) = state.session_for(job) else {
            return;
        };

        match outcome {
            ChunkOutcome::Acknowledged => {
                let ack = session.on_ack(index, job.epoch);
                let uploading = session.status() == UploadStatus::Uploading;
                let elapsed = session.elapsed();
                if ack.counted {
                    self.emit(UploadEvent::Progress {
                        name: name.to_string(),
                        percent: session.progress_percent(),
                        bytes_acknowledged: session.acked_bytes(),
                    });
                    if uploading {
                        state.current = Some(name.to_string());
                    }
                }
                if ack.completed {
                    state.active -= 1;
                    info!(
                        file = %name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "upload completed"
                    );
                    self.emit_status(name, UploadStatus::Completed);
                    self.stopped(state, name);
                    self.admit(state);
                } else {
                    self.dispatch(state, name);
                }
            }
            ChunkOutcome::Aborted => {
                let freed = session.on_aborted(index, job.epoch);
                debug!(file = %name, chunk = index, "chunk aborted");
                if freed {
                    self.dispatch(state, name);
                }
            }
            ChunkOutcome::Exhausted { attempts, message } => {
                let failure = ChunkFailure {
                    chunk_index: index,
                    offset: job.spec.offset,
                    attempts,
                    message,
                };
                if session.on_exhausted(index, job.epoch, failure.clone()) {
                    state.active -= 1;
                    warn!(
                        file = %name,
                        chunk = index,
                        attempts,
                        error = %failure.message,
                        "upload failed"
                    );
                    self.emit(UploadEvent::Failed {
                        name: name.to_string(),
                        failure,
                    });
                    self.emit_status(name, UploadStatus::Error);
                    self.stopped(state, name);
                    self.admit(state);
                } else {
                    self.dispatch(state, name);
                }
            }
        }

        self.publish(state);
    }

    fn pause_session(&self, state: &mut State, name: &str) -> Result<(), UploadError> {
        let aborted = state.session_mut(name)?.pause()?;
        state.active -= 1;
        info!(file = %name, aborted, "upload paused");
        self.emit_status(name, UploadStatus::Paused);
        self.stopped(state, name);
        Ok(())
    }

    /// Resumes `name` if a session slot is free; otherwise moves it back to
    /// `queued` and returns `false` so the caller can place it in the queue.
    fn resume_session(self: &Arc<Self>, state: &mut State, name: &str) -> Result<bool, UploadError> {
        let has_slot = state.active < self.config.max_parallel_sessions;
        let session = state.session_mut(name)?;
        if !has_slot {
            session.requeue()?;
            info!(file = %name, "upload requeued");
            self.emit_status(name, UploadStatus::Queued);
            return Ok(false);
        }
        let completed = session.resume()?;
        self.started(state, name, completed);
        Ok(true)
    }

    fn cancel_session(&self, state: &mut State, name: &str) -> Result<(), UploadError> {
        let from = state.session_mut(name)?.cancel()?;
        match from {
            UploadStatus::Uploading => state.active -= 1,
            UploadStatus::Queued => state.queue.retain(|n| n != name),
            _ => {}
        }
        info!(file = %name, from = %from, "upload cancelled");
        self.emit_status(name, UploadStatus::Cancelled);
        self.stopped(state, name);
        Ok(())
    }

    fn cancel_everything(&self, state: &mut State) -> usize {
        let names: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, s)| !s.status().is_terminal())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            if let Err(e) = self.cancel_session(state, name) {
                warn!(file = %name, error = %e, "cancel failed");
            }
        }
        names.len()
    }
}

/// Returns `name`, or `name (n)` with the smallest `n` that no live
/// session holds. The suffix goes before the extension of the last segment.
fn unique_name(sessions: &IndexMap<String, UploadSession>, name: &str) -> String {
    let live = |candidate: &str| {
        sessions
            .get(candidate)
            .is_some_and(|s| !s.status().is_terminal())
    };
    if !live(name) {
        return name.to_string();
    }

    let segment_start = name.rfind('/').map_or(0, |i| i + 1);
    let split = match name[segment_start..].rfind('.') {
        Some(dot) if dot > 0 => segment_start + dot,
        _ => name.len(),
    };
    let (stem, ext) = name.split_at(split);

    let mut n = 1u32;
    loop {
        let candidate = format!("{stem} ({n}){ext}");
        if !live(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;
    use uplink_protocol::ChunkReceipt;

    use crate::config::RetryPolicy;
    use crate::transport::{ChunkRequest, TransportFuture};

    // -----------------------------------------------------------------------
    // Mock transport
    // -----------------------------------------------------------------------

    /// Scripted transport. Each send optionally waits for a permit on
    /// `gate`, then fails if a failure is scheduled for its chunk.
    #[derive(Default)]
    struct MockTransport {
        gate: Option<Arc<Semaphore>>,
        failures: Mutex<HashMap<(String, u32), u32>>,
        /// Every attempt, in start order.
        attempts: Mutex<Vec<(String, u32)>>,
        /// Every acknowledged chunk.
        acked: Mutex<Vec<(String, u32)>>,
        in_flight: Mutex<HashMap<String, usize>>,
        max_in_flight: AtomicUsize,
    }

    impl MockTransport {
        fn gated() -> (Arc<Self>, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            let transport = Arc::new(Self {
                gate: Some(gate.clone()),
                ..Self::default()
            });
            (transport, gate)
        }

        fn fail(&self, file: &str, chunk: u32, times: u32) {
            self.failures
                .lock()
                .unwrap()
                .insert((file.to_string(), chunk), times);
        }

        fn attempts(&self) -> Vec<(String, u32)> {
            self.attempts.lock().unwrap().clone()
        }

        fn acked_chunks(&self, file: &str) -> Vec<u32> {
            self.acked
                .lock()
                .unwrap()
                .iter()
                .filter(|(f, _)| f == file)
                .map(|(_, c)| *c)
                .collect()
        }

        fn waiting(&self) -> usize {
            self.in_flight.lock().unwrap().values().sum()
        }
    }

    /// Decrements the per-file in-flight count when a send ends or is dropped.
    struct FlightGuard<'a> {
        transport: &'a MockTransport,
        file: String,
    }

    impl Drop for FlightGuard<'_> {
        fn drop(&mut self) {
            if let Some(n) = self.transport.in_flight.lock().unwrap().get_mut(&self.file) {
                *n -= 1;
            }
        }
    }

    impl ChunkTransport for MockTransport {
        fn send(&self, request: ChunkRequest, _cancel: CancellationToken) -> TransportFuture<'_> {
            Box::pin(async move {
                let file = request.file_name.clone();
                let index = request.chunk_index();
                self.attempts.lock().unwrap().push((file.clone(), index));
                {
                    let mut in_flight = self.in_flight.lock().unwrap();
                    let n = in_flight.entry(file.clone()).or_default();
                    *n += 1;
                    self.max_in_flight.fetch_max(*n, Ordering::SeqCst);
                }
                let _guard = FlightGuard {
                    transport: self,
                    file: file.clone(),
                };

                if let Some(gate) = &self.gate {
                    gate.acquire().await.unwrap().forget();
                }

                let fail = {
                    let mut failures = self.failures.lock().unwrap();
                    match failures.get_mut(&(file.clone(), index)) {
                        Some(left) if *left > 0 => {
                            *left -= 1;
                            true
                        }
                        _ => false,
                    }
                };
                if fail {
                    return Err(TransportError::Status {
                        status: 500,
                        body: "scripted failure".into(),
                    });
                }

                self.acked.lock().unwrap().push((file, index));
                Ok(ChunkReceipt::accepted(index))
            })
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn config(sessions: usize, chunks: usize) -> UploadConfig {
        UploadConfig {
            chunk_size: 4,
            max_parallel_sessions: sessions,
            max_parallel_chunks: chunks,
            chunk_timeout: Duration::from_secs(30),
            retry: RetryPolicy::immediate(3),
        }
    }

    fn file(name: &str, size: usize) -> FileDescriptor {
        FileDescriptor::from_bytes(name, vec![1u8; size])
    }

    /// Polls `cond` until it holds or a few seconds pass.
    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    async fn idle(manager: &UploadManager) {
        tokio::time::timeout(Duration::from_secs(5), manager.wait_idle())
            .await
            .expect("manager did not become idle");
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[test]
    fn invalid_config_rejected() {
        let transport = Arc::new(MockTransport::default());
        let mut cfg = config(1, 1);
        cfg.chunk_size = 0;
        assert!(matches!(
            UploadManager::new(cfg, transport.clone()),
            Err(ConfigError::ZeroChunkSize)
        ));
        assert!(matches!(
            UploadManager::new(config(0, 1), transport),
            Err(ConfigError::ZeroParallelSessions)
        ));
    }

    #[tokio::test]
    async fn single_file_completes_at_hundred_percent() {
        let transport = Arc::new(MockTransport::default());
        let manager = UploadManager::new(config(3, 3), transport.clone()).unwrap();

        let names = manager.enqueue(vec![file("video.mp4", 10)]).unwrap();
        assert_eq!(names, vec!["video.mp4"]);
        idle(&manager).await;

        let snapshot = manager.snapshot();
        let progress = &snapshot.per_file["video.mp4"];
        assert_eq!(progress.status, UploadStatus::Completed);
        assert_eq!(progress.progress_percent, 100.0);
        assert_eq!(progress.bytes_acknowledged, 10);
        assert_eq!(progress.chunks_acknowledged, 3);
        assert!(!snapshot.global_uploading);

        let mut acked = transport.acked_chunks("video.mp4");
        acked.sort();
        assert_eq!(acked, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn empty_file_sends_one_empty_chunk() {
        let transport = Arc::new(MockTransport::default());
        let manager = UploadManager::new(config(1, 1), transport.clone()).unwrap();

        manager.enqueue(vec![file("empty.txt", 0)]).unwrap();
        idle(&manager).await;

        assert_eq!(transport.acked_chunks("empty.txt"), vec![0]);
        let snapshot = manager.snapshot();
        let progress = &snapshot.per_file["empty.txt"];
        assert_eq!(progress.status, UploadStatus::Completed);
        assert_eq!(progress.progress_percent, 100.0);
    }

    #[tokio::test]
    async fn exhausted_chunk_errors_only_that_file() {
        let transport = Arc::new(MockTransport::default());
        transport.fail("bad.bin", 1, 3);
        let manager = UploadManager::new(config(2, 1), transport.clone()).unwrap();
        let mut events = manager.take_events().unwrap();
        assert!(manager.take_events().is_none());

        manager
            .enqueue(vec![file("bad.bin", 12), file("good.bin", 12)])
            .unwrap();
        idle(&manager).await;

        let snapshot = manager.snapshot();
        let bad = &snapshot.per_file["bad.bin"];
        assert_eq!(bad.status, UploadStatus::Error);
        assert_eq!(bad.chunks_acknowledged, 1);
        let failure = bad.failure.as_ref().unwrap();
        assert_eq!(failure.chunk_index, 1);
        assert_eq!(failure.offset, 4);
        assert_eq!(failure.attempts, 3);
        assert!(failure.message.contains("scripted failure"));
        assert_eq!(snapshot.per_file["good.bin"].status, UploadStatus::Completed);

        // Chunk 0 acknowledged, chunk 2 never attempted.
        assert_eq!(transport.acked_chunks("bad.bin"), vec![0]);
        let bad_attempts: Vec<u32> = transport
            .attempts()
            .into_iter()
            .filter(|(f, _)| f == "bad.bin")
            .map(|(_, c)| c)
            .collect();
        assert_eq!(bad_attempts, vec![0, 1, 1, 1]);

        let mut retries = 0;
        let mut failed = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                UploadEvent::ChunkRetry { ref name, .. } if name == "bad.bin" => retries += 1,
                UploadEvent::Failed { ref name, .. } if name == "bad.bin" => failed += 1,
                _ => {}
            }
        }
        assert_eq!((retries, failed), (2, 1));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let transport = Arc::new(MockTransport::default());
        transport.fail("flaky.bin", 0, 2);
        let manager = UploadManager::new(config(1, 1), transport.clone()).unwrap();

        manager.enqueue(vec![file("flaky.bin", 6)]).unwrap();
        idle(&manager).await;

        assert_eq!(manager.status("flaky.bin"), Some(UploadStatus::Completed));
        assert_eq!(transport.acked_chunks("flaky.bin"), vec![0, 1]);
    }

    #[tokio::test]
    async fn chunk_concurrency_is_bounded() {
        let (transport, gate) = MockTransport::gated();
        let manager = UploadManager::new(config(1, 2), transport.clone()).unwrap();

        manager.enqueue(vec![file("big.bin", 40)]).unwrap();
        eventually(|| transport.waiting() == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.waiting(), 2);

        gate.add_permits(100);
        idle(&manager).await;
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 2);
        assert_eq!(transport.acked_chunks("big.bin").len(), 10);
    }

    #[tokio::test]
    async fn second_file_waits_for_a_session_slot() {
        let (transport, gate) = MockTransport::gated();
        let manager = UploadManager::new(config(1, 1), transport.clone()).unwrap();

        manager
            .enqueue(vec![file("first.bin", 8), file("second.bin", 8)])
            .unwrap();
        eventually(|| transport.waiting() == 1).await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status_of("first.bin"), Some(UploadStatus::Uploading));
        assert_eq!(snapshot.status_of("second.bin"), Some(UploadStatus::Queued));
        assert!(snapshot.global_uploading);
        assert_eq!(snapshot.current.unwrap().file_name, "first.bin");

        gate.add_permits(2);
        eventually(|| manager.status("second.bin") == Some(UploadStatus::Uploading)).await;
        assert_eq!(manager.status("first.bin"), Some(UploadStatus::Completed));

        gate.add_permits(2);
        idle(&manager).await;
        assert_eq!(manager.status("second.bin"), Some(UploadStatus::Completed));
        assert!(
            transport
                .attempts()
                .iter()
                .position(|(f, _)| f == "second.bin")
                .unwrap()
                >= 2
        );
    }

    #[tokio::test]
    async fn pausing_admits_the_next_queued_file() {
        let (transport, gate) = MockTransport::gated();
        let manager = UploadManager::new(config(1, 1), transport.clone()).unwrap();

        manager
            .enqueue(vec![file("a.bin", 8), file("b.bin", 8)])
            .unwrap();
        eventually(|| transport.waiting() == 1).await;

        manager.pause("a.bin").unwrap();
        assert_eq!(manager.status("a.bin"), Some(UploadStatus::Paused));
        assert_eq!(manager.status("b.bin"), Some(UploadStatus::Uploading));

        // No slot: resume puts `a.bin` at the front of the queue.
        manager.resume("a.bin").unwrap();
        assert_eq!(manager.status("a.bin"), Some(UploadStatus::Queued));

        gate.add_permits(100);
        idle(&manager).await;
        assert_eq!(manager.status("a.bin"), Some(UploadStatus::Completed));
        assert_eq!(manager.status("b.bin"), Some(UploadStatus::Completed));
    }

    #[tokio::test]
    async fn resume_never_resends_acknowledged_chunks() {
        let (transport, gate) = MockTransport::gated();
        let manager = UploadManager::new(config(1, 1), transport.clone()).unwrap();

        manager.enqueue(vec![file("doc.pdf", 12)]).unwrap();
        gate.add_permits(1);
        eventually(|| {
            manager.snapshot().per_file["doc.pdf"].bytes_acknowledged == 4
                && transport.waiting() == 1
        })
        .await;

        manager.pause("doc.pdf").unwrap();
        let paused = manager.snapshot();
        assert_eq!(paused.status_of("doc.pdf"), Some(UploadStatus::Paused));
        assert!(!paused.global_uploading);
        assert!(paused.current.is_none());
        eventually(|| transport.waiting() == 0).await;

        manager.resume("doc.pdf").unwrap();
        gate.add_permits(100);
        idle(&manager).await;

        assert_eq!(manager.status("doc.pdf"), Some(UploadStatus::Completed));
        let acked = transport.acked_chunks("doc.pdf");
        assert_eq!(acked.iter().filter(|c| **c == 0).count(), 1);
        assert_eq!(acked, vec![0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_resume_never_sends_a_chunk_twice_at_once() {
        let (transport, gate) = MockTransport::gated();
        let manager = UploadManager::new(config(1, 1), transport.clone()).unwrap();

        manager.enqueue(vec![file("one.bin", 4)]).unwrap();
        eventually(|| transport.waiting() == 1).await;

        for _ in 0..50 {
            manager.pause("one.bin").unwrap();
            manager.resume("one.bin").unwrap();
        }
        eventually(|| transport.waiting() == 1).await;
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);

        gate.add_permits(100);
        idle(&manager).await;
        assert_eq!(manager.status("one.bin"), Some(UploadStatus::Completed));
        assert_eq!(transport.acked_chunks("one.bin"), vec![0]);
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completion_racing_pause_all_is_never_forced_back() {
        for _ in 0..20 {
            let (transport, gate) = MockTransport::gated();
            let manager = UploadManager::new(config(2, 1), transport.clone()).unwrap();

            manager
                .enqueue(vec![file("a.bin", 4), file("b.bin", 4)])
                .unwrap();
            eventually(|| transport.waiting() == 2).await;

            gate.add_permits(1);
            manager.pause_all();
            tokio::time::sleep(Duration::from_millis(5)).await;

            let snapshot = manager.snapshot();
            assert!(!snapshot.global_uploading);
            for name in ["a.bin", "b.bin"] {
                let status = snapshot.status_of(name);
                assert!(
                    matches!(status, Some(UploadStatus::Paused | UploadStatus::Completed)),
                    "{name}: {status:?}"
                );
            }

            manager.resume_all();
            gate.add_permits(100);
            idle(&manager).await;
            for name in ["a.bin", "b.bin"] {
                assert_eq!(manager.status(name), Some(UploadStatus::Completed));
                assert_eq!(transport.acked_chunks(name), vec![0]);
            }
        }
    }

    #[tokio::test]
    async fn cancel_frees_the_slot_immediately() {
        let (transport, gate) = MockTransport::gated();
        let manager = UploadManager::new(config(1, 2), transport.clone()).unwrap();

        manager
            .enqueue(vec![file("a.bin", 16), file("b.bin", 4)])
            .unwrap();
        eventually(|| transport.waiting() == 2).await;

        manager.cancel("a.bin").unwrap();
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status_of("a.bin"), Some(UploadStatus::Cancelled));
        assert_eq!(snapshot.status_of("b.bin"), Some(UploadStatus::Uploading));

        gate.add_permits(100);
        idle(&manager).await;
        assert_eq!(manager.status("b.bin"), Some(UploadStatus::Completed));
        assert!(transport.acked_chunks("a.bin").is_empty());
        assert_eq!(manager.snapshot().per_file["a.bin"].bytes_acknowledged, 0);
    }

    #[tokio::test]
    async fn cancel_queued_file_removes_it_from_the_queue() {
        let (transport, gate) = MockTransport::gated();
        let manager = UploadManager::new(config(1, 1), transport.clone()).unwrap();

        manager
            .enqueue(vec![file("a.bin", 4), file("b.bin", 4), file("c.bin", 4)])
            .unwrap();
        manager.cancel("b.bin").unwrap();

        gate.add_permits(100);
        idle(&manager).await;
        assert_eq!(manager.status("b.bin"), Some(UploadStatus::Cancelled));
        assert_eq!(manager.status("c.bin"), Some(UploadStatus::Completed));
        assert!(transport.acked_chunks("b.bin").is_empty());
    }

    #[tokio::test]
    async fn pause_all_then_resume_all() {
        let (transport, gate) = MockTransport::gated();
        let manager = UploadManager::new(config(2, 1), transport.clone()).unwrap();

        manager
            .enqueue(vec![file("a.bin", 8), file("b.bin", 8), file("c.bin", 8)])
            .unwrap();
        eventually(|| transport.waiting() == 2).await;

        assert_eq!(manager.pause_all_uploads(), 2);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status_of("a.bin"), Some(UploadStatus::Paused));
        assert_eq!(snapshot.status_of("b.bin"), Some(UploadStatus::Paused));
        // Queued files are not admitted into the freed slots.
        assert_eq!(snapshot.status_of("c.bin"), Some(UploadStatus::Queued));
        assert!(!snapshot.global_uploading);

        assert_eq!(manager.resume_all_uploads(), 2);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status_of("a.bin"), Some(UploadStatus::Uploading));
        assert_eq!(snapshot.status_of("b.bin"), Some(UploadStatus::Uploading));
        assert_eq!(snapshot.status_of("c.bin"), Some(UploadStatus::Queued));

        gate.add_permits(100);
        idle(&manager).await;
        assert!(manager.snapshot().all_settled());
        for name in ["a.bin", "b.bin", "c.bin"] {
            assert_eq!(manager.status(name), Some(UploadStatus::Completed));
        }
    }

    #[tokio::test]
    async fn resume_all_requeues_in_enqueue_order_when_slots_are_short() {
        let (transport, gate) = MockTransport::gated();
        let manager = UploadManager::new(config(1, 1), transport.clone()).unwrap();

        manager
            .enqueue(vec![file("a.bin", 4), file("b.bin", 4), file("c.bin", 4)])
            .unwrap();
        eventually(|| transport.waiting() == 1).await;
        manager.pause("a.bin").unwrap();
        eventually(|| manager.status("b.bin") == Some(UploadStatus::Uploading)).await;
        manager.pause("b.bin").unwrap();
        assert_eq!(manager.status("c.bin"), Some(UploadStatus::Uploading));

        assert_eq!(manager.resume_all(), 2);
        assert_eq!(manager.status("a.bin"), Some(UploadStatus::Queued));
        assert_eq!(manager.status("b.bin"), Some(UploadStatus::Queued));

        gate.add_permits(100);
        idle(&manager).await;
        let order: Vec<String> = transport
            .acked
            .lock()
            .unwrap()
            .iter()
            .map(|(f, _)| f.clone())
            .collect();
        assert_eq!(order, vec!["c.bin", "a.bin", "b.bin"]);
    }

    #[tokio::test]
    async fn illegal_commands_are_rejected() {
        let (transport, gate) = MockTransport::gated();
        let manager = UploadManager::new(config(1, 1), transport).unwrap();

        assert!(matches!(
            manager.pause("missing"),
            Err(UploadError::UnknownSession(_))
        ));

        manager
            .enqueue(vec![file("a.bin", 4), file("b.bin", 4)])
            .unwrap();
        let err = manager.resume("b.bin").unwrap_err();
        assert!(matches!(
            err,
            UploadError::InvalidTransition {
                from: UploadStatus::Queued,
                command: "resume",
                ..
            }
        ));
        assert!(manager.pause("b.bin").is_err());

        gate.add_permits(100);
        idle(&manager).await;
        let err = manager.pause("a.bin").unwrap_err();
        assert!(matches!(
            err,
            UploadError::InvalidTransition {
                from: UploadStatus::Completed,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "cannot pause \"a.bin\" while completed"
        );
        assert!(manager.cancel("a.bin").is_err());
        assert_eq!(manager.status("a.bin"), Some(UploadStatus::Completed));
    }

    #[tokio::test]
    async fn duplicate_names_are_suffixed_and_finished_ones_replaced() {
        let (transport, gate) = MockTransport::gated();
        let manager = UploadManager::new(config(3, 1), transport).unwrap();

        let names = manager
            .enqueue(vec![
                file("report.pdf", 4),
                file("report.pdf", 4),
                file("dir/report.pdf", 4),
                file("report.pdf", 4),
            ])
            .unwrap();
        assert_eq!(
            names,
            vec![
                "report.pdf",
                "report (1).pdf",
                "dir/report.pdf",
                "report (2).pdf"
            ]
        );

        gate.add_permits(100);
        idle(&manager).await;

        let names = manager.enqueue(vec![file("report.pdf", 8)]).unwrap();
        assert_eq!(names, vec!["report.pdf"]);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.per_file.len(), 4);
        assert_eq!(snapshot.per_file["report.pdf"].total_bytes, 8);
        // Replaced entries move to the end.
        assert_eq!(snapshot.per_file.keys().last().unwrap(), "report.pdf");
    }

    #[test]
    fn suffix_goes_before_extension() {
        let mut sessions = IndexMap::new();
        for name in ["a", ".env", "x/archive.tar.gz"] {
            let file = FileDescriptor::from_bytes(name, Vec::new());
            let plan = ChunkPlan::new(0, NonZeroU64::new(4).unwrap()).unwrap();
            sessions.insert(name.to_string(), UploadSession::new("id".into(), file, plan));
        }
        assert_eq!(unique_name(&sessions, "a"), "a (1)");
        assert_eq!(unique_name(&sessions, ".env"), ".env (1)");
        assert_eq!(
            unique_name(&sessions, "x/archive.tar.gz"),
            "x/archive.tar (1).gz"
        );
        assert_eq!(unique_name(&sessions, "b.txt"), "b.txt");
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let transport = Arc::new(MockTransport::default());
        let manager = UploadManager::new(config(1, 3), transport).unwrap();
        let mut events = manager.take_events().unwrap();

        manager.enqueue(vec![file("movie.mkv", 37)]).unwrap();
        idle(&manager).await;

        let mut last = 0.0;
        let mut seen = 0;
        while let Ok(event) = events.try_recv() {
            if let UploadEvent::Progress { percent, .. } = event {
                assert!(percent >= last, "{percent} < {last}");
                last = percent;
                seen += 1;
            }
        }
        assert_eq!(seen, 10);
        assert_eq!(last, 100.0);
    }

    #[tokio::test]
    async fn forget_and_shutdown() {
        let (transport, gate) = MockTransport::gated();
        let manager = UploadManager::new(config(1, 1), transport).unwrap();

        manager
            .enqueue(vec![file("done.bin", 4), file("stuck.bin", 4)])
            .unwrap();
        gate.add_permits(1);
        eventually(|| manager.status("done.bin") == Some(UploadStatus::Completed)).await;

        assert!(manager.forget("stuck.bin").is_err());
        manager.forget("done.bin").unwrap();
        assert!(manager.status("done.bin").is_none());

        manager.shutdown();
        assert!(manager.snapshot().per_file.is_empty());
        assert!(matches!(
            manager.enqueue(vec![file("late.bin", 4)]),
            Err(UploadError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn upload_ingests_a_folder() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("album");
        std::fs::create_dir_all(root.join("disc1")).unwrap();
        std::fs::write(root.join("cover.jpg"), b"JPEG").unwrap();
        std::fs::write(root.join("disc1").join("01.flac"), b"FLACDATA!").unwrap();

        let transport = Arc::new(MockTransport::default());
        let manager = UploadManager::new(config(2, 2), transport.clone()).unwrap();

        let names = manager.upload(Selection::Folder(root)).await.unwrap();
        assert_eq!(names, vec!["album/cover.jpg", "album/disc1/01.flac"]);
        idle(&manager).await;

        assert!(manager.snapshot().all_settled());
        assert_eq!(
            manager.snapshot().per_file["album/disc1/01.flac"].total_chunks,
            3
        );
    }
}
