//! Per-file upload state machine.
//!
//! A session owns its chunk table and counters but performs no I/O. The
//! manager drives it under a lock and spawns the chunk tasks it hands out.
//!
//! ```text
//! queued ──admit──▶ uploading ──all acked──▶ completed
//!   ▲                 │   │
//!   └──requeue──┐     │   └──retries exhausted──▶ error
//!               │   pause
//!               │     ▼
//!             paused ──resume──▶ uploading
//!
//! queued | uploading | paused ──cancel──▶ cancelled
//! ```
//!
//! Every run (admit or resume) gets a fresh epoch and a child cancellation
//! token. Chunk tasks report with the epoch they were started under. A chunk
//! whose task belongs to an aborted run stays `Aborting` and keeps its
//! in-flight slot until that task reports, so a chunk is never sent by two
//! tasks at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use uplink_protocol::{ChunkFailure, FileProgress, UploadStatus};
use uplink_transfer::{ChunkPlan, ChunkSpec, ContentSource};

use crate::error::UploadError;
use crate::types::FileDescriptor;

/// Upload state of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkState {
    Pending,
    InFlight,
    /// Its run was cancelled but the task has not reported yet.
    Aborting,
    Acknowledged,
    Failed,
}

/// Work handed out by [`UploadSession::next_chunk`].
#[derive(Debug, Clone)]
pub(crate) struct ChunkTicket {
    pub spec: ChunkSpec,
    pub epoch: u64,
    /// Failed attempts of this chunk in earlier runs.
    pub failed_attempts: u32,
    pub cancel: CancellationToken,
}

/// What an acknowledgement changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AckOutcome {
    /// The chunk was counted for the first time.
    pub counted: bool,
    /// The last chunk was acknowledged and the session is now completed.
    pub completed: bool,
}

#[derive(Debug)]
pub(crate) struct UploadSession {
    id: String,
    file: FileDescriptor,
    plan: ChunkPlan,
    status: UploadStatus,
    chunks: Vec<ChunkState>,
    /// Epoch of the task holding each chunk's in-flight slot, of any run.
    running: Vec<Option<u64>>,
    /// Failed attempts per chunk, across runs.
    attempts: Vec<u32>,
    acked_bytes: u64,
    acked_chunks: u32,
    in_flight: usize,
    /// No pending chunk has an index below this.
    scan_from: u32,
    failure: Option<ChunkFailure>,
    cancel: CancellationToken,
    run: Option<CancellationToken>,
    epoch: u64,
    created_at: Instant,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl UploadSession {
    pub fn new(id: String, file: FileDescriptor, plan: ChunkPlan) -> Self {
        let total = plan.total_chunks() as usize;
        Self {
            id,
            file,
            plan,
            status: UploadStatus::Queued,
            chunks: vec![ChunkState::Pending; total],
            running: vec![None; total],
            attempts: vec![0; total],
            acked_bytes: 0,
            acked_chunks: 0,
            in_flight: 0,
            scan_from: 0,
            failure: None,
            cancel: CancellationToken::new(),
            run: None,
            epoch: 0,
            created_at: Instant::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.file.name()
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    pub fn content(&self) -> &Arc<dyn ContentSource> {
        self.file.content()
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    #[cfg(test)]
    pub fn chunk_state(&self, index: u32) -> Option<ChunkState> {
        self.chunks.get(index as usize).copied()
    }

    /// Time from first admission to the terminal transition, or until now.
    pub fn elapsed(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => end - start,
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Time spent waiting in the queue before the first admission.
    pub fn queued_for(&self) -> Duration {
        self.started_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.created_at)
    }

    pub fn acked_bytes(&self) -> u64 {
        self.acked_bytes
    }

    #[cfg(test)]
    pub fn failed_attempts(&self, index: u32) -> u32 {
        self.attempts.get(index as usize).copied().unwrap_or(0)
    }

    /// Acknowledged bytes over total bytes, in percent.
    ///
    /// An empty file reports 0 until its single chunk is acknowledged.
    pub fn progress_percent(&self) -> f64 {
        let total = self.plan.total_size();
        if total == 0 {
            return if self.acked_chunks == self.plan.total_chunks() {
                100.0
            } else {
                0.0
            };
        }
        self.acked_bytes as f64 / total as f64 * 100.0
    }

    pub fn progress(&self) -> FileProgress {
        FileProgress {
            status: self.status,
            progress_percent: self.progress_percent(),
            bytes_acknowledged: self.acked_bytes,
            total_bytes: self.plan.total_size(),
            chunks_acknowledged: self.acked_chunks,
            total_chunks: self.plan.total_chunks(),
            failure: self.failure.clone(),
        }
    }

    fn invalid(&self, command: &'static str) -> UploadError {
        UploadError::InvalidTransition {
            name: self.name().to_string(),
            from: self.status,
            command,
        }
    }

    /// Starts a run. Returns `true` if there was nothing left to send
    /// (late acknowledgements finished the file while it was paused).
    fn start_run(&mut self) -> bool {
        self.started_at.get_or_insert_with(Instant::now);
        self.epoch += 1;
        if self.acked_chunks == self.plan.total_chunks() {
            self.status = UploadStatus::Completed;
            self.finished_at = Some(Instant::now());
            return true;
        }
        self.run = Some(self.cancel.child_token());
        self.status = UploadStatus::Uploading;
        false
    }

    /// Aborts the current run. In-flight chunks become `Aborting` and keep
    /// their slot until their task reports.
    fn stop_run(&mut self) {
        self.epoch += 1;
        if let Some(run) = self.run.take() {
            run.cancel();
        }
        for state in &mut self.chunks {
            if *state == ChunkState::InFlight {
                *state = ChunkState::Aborting;
            }
        }
    }

    /// `queued → uploading`. `Ok(true)` means it completed on the spot.
    pub fn admit(&mut self) -> Result<bool, UploadError> {
        if self.status != UploadStatus::Queued {
            return Err(self.invalid("admit"));
        }
        Ok(self.start_run())
    }

    /// `uploading → paused`. Returns how many in-flight chunks were aborted.
    pub fn pause(&mut self) -> Result<usize, UploadError> {
        if self.status != UploadStatus::Uploading {
            return Err(self.invalid("pause"));
        }
        let aborted = self.in_flight;
        self.stop_run();
        self.status = UploadStatus::Paused;
        Ok(aborted)
    }

    /// `paused → uploading`. `Ok(true)` means it completed on the spot.
    pub fn resume(&mut self) -> Result<bool, UploadError> {
        if self.status != UploadStatus::Paused {
            return Err(self.invalid("resume"));
        }
        Ok(self.start_run())
    }

    /// `paused → queued`, used when a resume finds no free slot.
    pub fn requeue(&mut self) -> Result<(), UploadError> {
        if self.status != UploadStatus::Paused {
            return Err(self.invalid("resume"));
        }
        self.status = UploadStatus::Queued;
        Ok(())
    }

    /// Any non-terminal state `→ cancelled`. Returns the previous status.
    pub fn cancel(&mut self) -> Result<UploadStatus, UploadError> {
        let from = self.status;
        if from.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        self.stop_run();
        self.cancel.cancel();
        self.status = UploadStatus::Cancelled;
        self.finished_at = Some(Instant::now());
        Ok(from)
    }

    /// Hands out the lowest-index pending chunk while the session is
    /// uploading and below `limit` in-flight chunks. Slots still held by
    /// tasks of an aborted run count against `limit`.
    pub fn next_chunk(&mut self, limit: usize) -> Option<ChunkTicket> {
        if self.status != UploadStatus::Uploading || self.in_flight >= limit {
            return None;
        }
        let cancel = self.run.clone()?;
        let start = self.scan_from as usize;
        let offset = self.chunks[start..]
            .iter()
            .position(|s| *s == ChunkState::Pending)?;
        let index = (start + offset) as u32;
        let i = index as usize;
        let spec = self.plan.get(index)?;

        self.chunks[i] = ChunkState::InFlight;
        self.running[i] = Some(self.epoch);
        self.in_flight += 1;
        self.scan_from = index + 1;

        Some(ChunkTicket {
            spec,
            epoch: self.epoch,
            failed_attempts: self.attempts[i],
            cancel,
        })
    }

    /// Releases the in-flight slot of `index` if the task started under
    /// `epoch` holds it. An unacknowledged chunk goes back to pending.
    fn release(&mut self, index: u32, epoch: u64) -> bool {
        let i = index as usize;
        if self.running[i] != Some(epoch) {
            return false;
        }
        self.running[i] = None;
        self.in_flight -= 1;
        if matches!(self.chunks[i], ChunkState::InFlight | ChunkState::Aborting) {
            self.chunks[i] = ChunkState::Pending;
            self.scan_from = self.scan_from.min(index);
        }
        true
    }

    /// Records an endpoint acknowledgement for chunk `index`.
    ///
    /// A late acknowledgement from an aborted run still counts: the endpoint
    /// has the bytes. It is ignored once the session was cancelled, and a
    /// chunk is never counted twice.
    pub fn on_ack(&mut self, index: u32, epoch: u64) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        if index >= self.plan.total_chunks() {
            return outcome;
        }
        self.release(index, epoch);
        if self.status == UploadStatus::Cancelled {
            return outcome;
        }

        let slot = &mut self.chunks[index as usize];
        if *slot == ChunkState::Acknowledged {
            return outcome;
        }
        *slot = ChunkState::Acknowledged;
        self.acked_chunks += 1;
        if let Some(spec) = self.plan.get(index) {
            self.acked_bytes += spec.length;
        }
        outcome.counted = true;

        if self.status == UploadStatus::Uploading && self.acked_chunks == self.plan.total_chunks()
        {
            self.status = UploadStatus::Completed;
            self.finished_at = Some(Instant::now());
            if let Some(run) = self.run.take() {
                run.cancel();
            }
            outcome.completed = true;
        }
        outcome
    }

    /// Records one failed attempt of chunk `index`.
    pub fn on_attempt_failed(&mut self, index: u32) {
        if let Some(count) = self.attempts.get_mut(index as usize) {
            *count += 1;
        }
    }

    /// A chunk task stopped because its run was cancelled. Returns `true`
    /// if this freed a slot.
    pub fn on_aborted(&mut self, index: u32, epoch: u64) -> bool {
        index < self.plan.total_chunks() && self.release(index, epoch)
    }

    /// Chunk `index` ran out of attempts. Moves the session to `error` and
    /// aborts its other in-flight chunks. Returns `false` for reports from
    /// an aborted run, which only free their slot.
    pub fn on_exhausted(&mut self, index: u32, epoch: u64, failure: ChunkFailure) -> bool {
        if index >= self.plan.total_chunks()
            || !self.release(index, epoch)
            || epoch != self.epoch
            || self.status != UploadStatus::Uploading
            || self.chunks[index as usize] == ChunkState::Acknowledged
        {
            return false;
        }
        self.stop_run();
        self.chunks[index as usize] = ChunkState::Failed;
        self.failure = Some(failure);
        self.status = UploadStatus::Error;
        self.finished_at = Some(Instant::now());
        true
    }
}
