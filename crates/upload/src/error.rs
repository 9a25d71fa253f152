//! Upload engine error types.

use std::path::PathBuf;

use uplink_protocol::UploadStatus;
use uplink_transfer::TransferError;

/// Errors returned by [`UploadManager`](crate::UploadManager) commands.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("no upload named {0:?}")]
    UnknownSession(String),

    #[error("cannot {command} {name:?} while {from}")]
    InvalidTransition {
        name: String,
        from: UploadStatus,
        command: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("chunk plan error: {0}")]
    Plan(#[from] TransferError),

    #[error("upload manager is shut down")]
    ShutDown,
}

/// Invalid engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("max parallel sessions must be greater than zero")]
    ZeroParallelSessions,

    #[error("max parallel chunks must be greater than zero")]
    ZeroParallelChunks,

    #[error("chunk timeout must be greater than zero")]
    ZeroTimeout,

    #[error("retry policy needs at least one attempt")]
    ZeroRetryAttempts,

    #[error("backoff factor must be finite and jitter within 0..=1")]
    InvalidBackoff,
}

/// Failure turning a user selection into file descriptors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error(transparent)]
    InvalidName(#[from] TransferError),

    #[error("ingestion task failed: {0}")]
    Join(String),
}

impl IngestError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound(path);
        }
        Self::Io { path, source }
    }
}
