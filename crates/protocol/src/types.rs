use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Lifecycle status of one file's upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Uploading,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl UploadStatus {
    /// Returns `true` for `completed`, `error` and `cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Uploading => "uploading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostics for a chunk that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFailure {
    pub chunk_index: u32,
    pub offset: u64,
    pub attempts: u32,
    pub message: String,
}

/// Per-file entry of the presentation snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub status: UploadStatus,
    pub progress_percent: f64,
    pub bytes_acknowledged: u64,
    pub total_bytes: u64,
    pub chunks_acknowledged: u32,
    pub total_chunks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ChunkFailure>,
}

/// The single "now uploading" indicator shown above the file list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUpload {
    pub file_name: String,
    pub progress: f64,
}

/// Read-only view of every session, in enqueue order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSnapshot {
    pub per_file: IndexMap<String, FileProgress>,
    pub global_uploading: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<CurrentUpload>,
}

impl UploadSnapshot {
    /// Returns the status of `name`, if a session with that name exists.
    pub fn status_of(&self, name: &str) -> Option<UploadStatus> {
        self.per_file.get(name).map(|p| p.status)
    }

    /// Returns `true` when no session is queued, uploading or paused.
    pub fn all_settled(&self) -> bool {
        self.per_file.values().all(|p| p.status.is_terminal())
    }

    /// Returns `true` when nothing is queued or uploading.
    pub fn is_idle(&self) -> bool {
        !self
            .per_file
            .values()
            .any(|p| matches!(p.status, UploadStatus::Queued | UploadStatus::Uploading))
    }
}
