//! Engine configuration and the per-chunk retry policy.

use std::num::NonZeroU64;
use std::time::Duration;

use uplink_transfer::DEFAULT_CHUNK_SIZE;

use crate::error::ConfigError;

/// Default number of sessions allowed to upload at once.
pub const DEFAULT_MAX_PARALLEL_SESSIONS: usize = 3;

/// Default number of in-flight chunks per session.
pub const DEFAULT_MAX_PARALLEL_CHUNKS: usize = 3;

/// Default upper bound for a single chunk transport call.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(60);

/// Construction-time parameters of an [`UploadManager`](crate::UploadManager).
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Chunk size for files that do not declare their own.
    pub chunk_size: u64,
    /// Sessions allowed in `uploading` simultaneously.
    pub max_parallel_sessions: usize,
    /// In-flight chunks allowed per session.
    pub max_parallel_chunks: usize,
    /// Upper bound for one transport call; expiry counts as a failed attempt.
    pub chunk_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_parallel_sessions: DEFAULT_MAX_PARALLEL_SESSIONS,
            max_parallel_chunks: DEFAULT_MAX_PARALLEL_CHUNKS,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl UploadConfig {
    /// Rejects values that would make the engine unable to make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_chunk_size()?;
        if self.max_parallel_sessions == 0 {
            return Err(ConfigError::ZeroParallelSessions);
        }
        if self.max_parallel_chunks == 0 {
            return Err(ConfigError::ZeroParallelChunks);
        }
        if self.chunk_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroRetryAttempts);
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) || !self.retry.backoff_factor.is_finite() {
            return Err(ConfigError::InvalidBackoff);
        }
        Ok(())
    }

    pub(crate) fn default_chunk_size(&self) -> Result<NonZeroU64, ConfigError> {
        NonZeroU64::new(self.chunk_size).ok_or(ConfigError::ZeroChunkSize)
    }
}

/// Bounded retry with exponential backoff for a single chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per chunk, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Fraction of the delay applied as random jitter (0.25 = ±25%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, for tests and local endpoints.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        let with_jitter = (capped + capped * self.jitter * offset).max(0.0);
        Duration::from_secs_f64(with_jitter)
    }
}
