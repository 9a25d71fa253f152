//! Resumable chunked upload engine.
//!
//! Files are split into fixed-size chunks and sent through a
//! [`ChunkTransport`] with bounded retry. Each file is an upload session
//! that can be paused, resumed and cancelled independently; the
//! [`UploadManager`] admits sessions under a concurrency budget and
//! publishes an [`UploadSnapshot`](uplink_protocol::UploadSnapshot) for
//! presentation layers.
//!
//! # Flow
//!
//! 1. **Ingest**: a [`Selection`] is flattened into [`FileDescriptor`]s
//! 2. **Enqueue**: one `queued` session per file
//! 3. **Admit**: up to `max_parallel_sessions` sessions start uploading
//! 4. **Dispatch**: up to `max_parallel_chunks` chunk tasks per session
//! 5. **Report**: acknowledgements update progress and free slots

pub mod config;
pub mod error;
pub mod ingest;
pub mod manager;
mod session;
pub mod transport;
pub mod types;
mod worker;

// Re-export primary types for convenience.
pub use config::{RetryPolicy, UploadConfig};
pub use error::{ConfigError, IngestError, UploadError};
pub use ingest::{DroppedItem, Selection};
pub use manager::UploadManager;
pub use transport::{
    ChunkRequest, ChunkTransport, HttpChunkTransport, TransportError, TransportFuture,
};
pub use types::{FileDescriptor, UploadEvent};
