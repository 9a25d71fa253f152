//! Retry loop for a single chunk.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use uplink_transfer::{ChunkPayload, ChunkSpec, ContentSource};

use crate::config::RetryPolicy;
use crate::transport::{ChunkRequest, ChunkTransport, TransportError};

/// Everything a chunk task needs, detached from the session lock.
#[derive(Debug, Clone)]
pub(crate) struct ChunkJob {
    pub session_id: String,
    pub file_name: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub spec: ChunkSpec,
    pub epoch: u64,
    /// Failed attempts in earlier runs; they count against the budget.
    pub prior_attempts: u32,
    pub content: Arc<dyn ContentSource>,
    pub cancel: CancellationToken,
}

/// How a chunk task ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChunkOutcome {
    Acknowledged,
    /// The run was cancelled (pause, cancel or a sibling chunk failing).
    Aborted,
    Exhausted { attempts: u32, message: String },
}

/// Sends `job` until the endpoint acknowledges it, the retry budget runs
/// out, or the run is cancelled. `on_failure` sees every failed attempt,
/// numbered from `job.prior_attempts + 1`. A job always makes at least one
/// attempt.
pub(crate) async fn run_chunk(
    job: &ChunkJob,
    transport: &dyn ChunkTransport,
    retry: &RetryPolicy,
    timeout: Duration,
    mut on_failure: impl FnMut(u32, &TransportError),
) -> ChunkOutcome {
    let index = job.spec.index;
    let mut attempt = job.prior_attempts;

    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => return ChunkOutcome::Aborted,
            result = send_once(job, transport, timeout) => result,
        };

        let err = match result {
            Ok(()) => {
                debug!(file = %job.file_name, chunk = index, attempt, "chunk acknowledged");
                return ChunkOutcome::Acknowledged;
            }
            Err(TransportError::Cancelled) => return ChunkOutcome::Aborted,
            Err(e) => e,
        };

        on_failure(attempt, &err);
        if attempt >= retry.max_attempts {
            warn!(
                file = %job.file_name,
                chunk = index,
                attempts = attempt,
                error = %err,
                "chunk failed, retries exhausted"
            );
            return ChunkOutcome::Exhausted {
                attempts: attempt,
                message: err.to_string(),
            };
        }

        let delay = retry.delay_for_attempt(attempt);
        warn!(
            file = %job.file_name,
            chunk = index,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "chunk attempt failed, retrying"
        );
        tokio::select! {
            biased;
            _ = job.cancel.cancelled() => return ChunkOutcome::Aborted,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// One attempt: slice the bytes, then send them within `timeout`.
async fn send_once(
    job: &ChunkJob,
    transport: &dyn ChunkTransport,
    timeout: Duration,
) -> Result<(), TransportError> {
    let payload = ChunkPayload::load(job.content.as_ref(), job.spec).await?;
    let request = ChunkRequest {
        file_id: job.session_id.clone(),
        file_name: job.file_name.clone(),
        total_chunks: job.total_chunks,
        total_size: job.total_size,
        payload,
    };

    match tokio::time::timeout(timeout, transport.send(request, job.cancel.clone())).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}
