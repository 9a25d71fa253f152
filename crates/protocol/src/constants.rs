/// Multipart field names of a chunk upload request.
///
/// Every chunk is one `POST` to the endpoint; all fields except
/// [`fields::CHUNK`] are text parts.
pub mod fields {
    /// Stable identifier of the upload session (UUID v4).
    pub const FILE_ID: &str = "fileId";
    /// Display name of the file (the session key).
    pub const FILE_NAME: &str = "fileName";
    /// Zero-based chunk index.
    pub const CHUNK_INDEX: &str = "chunkIndex";
    pub const TOTAL_CHUNKS: &str = "totalChunks";
    /// Byte offset of the chunk within the file.
    pub const OFFSET: &str = "offset";
    pub const TOTAL_SIZE: &str = "totalSize";
    /// Lowercase hex SHA-256 of the chunk payload.
    pub const CHECKSUM: &str = "checksum";
    /// Binary part holding the chunk bytes.
    pub const CHUNK: &str = "chunk";
}
