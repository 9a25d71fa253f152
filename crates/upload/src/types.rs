//! Data types shared by the upload engine.

use std::num::NonZeroU64;
use std::path::PathBuf;
use std::sync::Arc;

use uplink_protocol::{ChunkFailure, UploadStatus};
use uplink_transfer::{ContentSource, FileContent, MemoryContent};

/// A file ready to be enqueued: its upload name, size and byte source.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    name: String,
    size: u64,
    content: Arc<dyn ContentSource>,
    chunk_size: Option<NonZeroU64>,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64, content: Arc<dyn ContentSource>) -> Self {
        Self {
            name: name.into(),
            size,
            content,
            chunk_size: None,
        }
    }

    /// A file on disk. `size` is the length observed at ingestion.
    pub fn from_path(name: impl Into<String>, path: impl Into<PathBuf>, size: u64) -> Self {
        Self::new(name, size, Arc::new(FileContent::new(path)))
    }

    /// An in-memory blob.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(name, size, Arc::new(MemoryContent::new(data)))
    }

    /// Overrides the engine's default chunk size for this file.
    pub fn with_chunk_size(mut self, chunk_size: NonZeroU64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content(&self) -> &Arc<dyn ContentSource> {
        &self.content
    }

    pub fn chunk_size(&self) -> Option<NonZeroU64> {
        self.chunk_size
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
    }
}

/// Event emitted while uploads make progress.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// A session moved to a new status.
    StatusChanged { name: String, status: UploadStatus },
    /// A chunk was acknowledged.
    Progress {
        name: String,
        percent: f64,
        bytes_acknowledged: u64,
    },
    /// A chunk attempt failed and will be retried.
    ChunkRetry {
        name: String,
        chunk_index: u32,
        attempt: u32,
        error: String,
    },
    /// A chunk exhausted its retries; the session is now in `error`.
    Failed { name: String, failure: ChunkFailure },
}

impl UploadEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::StatusChanged { name, .. }
            | Self::Progress { name, .. }
            | Self::ChunkRetry { name, .. }
            | Self::Failed { name, .. } => name,
        }
    }
}
