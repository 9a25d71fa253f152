//! Chunk planning and on-demand content slicing for resumable uploads.
//!
//! A [`ChunkPlan`] is pure arithmetic over `(total_size, chunk_size)`; bytes
//! are only read from a [`ContentSource`] right before a chunk is sent.

mod checksum;
mod content;
mod plan;
mod validation;

pub use checksum::checksum_bytes;
pub use content::{ChunkPayload, ContentFuture, ContentSource, FileContent, MemoryContent};
pub use plan::{ChunkIter, ChunkPlan, ChunkSpec};
pub use validation::normalize_upload_name;

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("range {offset}+{len} out of bounds for {size} bytes")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("file of {total_size} bytes needs more than {max} chunks")]
    TooManyChunks { total_size: u64, max: u32 },

    #[error("invalid name: {0}")]
    InvalidName(String),
}
