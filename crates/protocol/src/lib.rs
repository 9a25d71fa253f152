//! Shared types for the Uplink upload engine.
//!
//! Statuses and snapshots consumed by presentation layers, plus the
//! field names and receipt body of the chunk upload endpoint.

pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use messages::ChunkReceipt;
pub use types::{ChunkFailure, CurrentUpload, FileProgress, UploadSnapshot, UploadStatus};
