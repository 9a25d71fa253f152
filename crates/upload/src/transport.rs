//! Chunk transport trait and the HTTP multipart implementation.
//!
//! The engine only ever talks to a `ChunkTransport`. Tests plug in mocks;
//! production code uses [`HttpChunkTransport`], which POSTs each chunk as a
//! multipart form to a single endpoint.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use uplink_protocol::ChunkReceipt;
use uplink_protocol::constants::fields;
use uplink_transfer::{ChunkPayload, TransferError};

/// Longest endpoint body kept in a [`TransportError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Errors from a single chunk send attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("chunk rejected: {0}")]
    Rejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("content error: {0}")]
    Content(#[from] TransferError),

    #[error("invalid auth token")]
    InvalidToken,

    #[error("cancelled")]
    Cancelled,
}

/// One chunk plus the file metadata the endpoint needs to reassemble it.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    /// Stable identifier of the upload session.
    pub file_id: String,
    pub file_name: String,
    pub total_chunks: u32,
    pub total_size: u64,
    pub payload: ChunkPayload,
}

impl ChunkRequest {
    pub fn chunk_index(&self) -> u32 {
        self.payload.spec.index
    }
}

/// Boxed future returned by [`ChunkTransport::send`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ChunkReceipt, TransportError>> + Send + 'a>>;

/// Delivers one chunk to the remote endpoint.
///
/// An `Ok` receipt means the endpoint persisted the chunk. Implementations
/// should stop work and return [`TransportError::Cancelled`] once `cancel`
/// fires; the engine also drops the future at that point.
pub trait ChunkTransport: Send + Sync {
    fn send(&self, request: ChunkRequest, cancel: CancellationToken) -> TransportFuture<'_>;
}

/// Multipart POST transport.
///
/// Each chunk becomes one request carrying the `fileId`, `fileName`,
/// `chunkIndex`, `totalChunks`, `offset`, `totalSize` and `checksum` text
/// fields followed by the raw bytes in a `chunk` part. Any 2xx is an
/// acknowledgement unless the body is a JSON receipt with `success: false`.
pub struct HttpChunkTransport {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpChunkTransport {
    /// Creates a transport for `endpoint`, optionally sending a bearer token.
    pub fn new(endpoint: impl Into<String>, token: Option<&str>) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| TransportError::InvalidToken)?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn form(request: ChunkRequest) -> Result<Form, TransportError> {
        let spec = request.payload.spec;
        let part = Part::bytes(request.payload.data)
            .file_name(request.file_name.clone())
            .mime_str("application/octet-stream")?;

        Ok(Form::new()
            .text(fields::FILE_ID, request.file_id)
            .text(fields::FILE_NAME, request.file_name)
            .text(fields::CHUNK_INDEX, spec.index.to_string())
            .text(fields::TOTAL_CHUNKS, request.total_chunks.to_string())
            .text(fields::OFFSET, spec.offset.to_string())
            .text(fields::TOTAL_SIZE, request.total_size.to_string())
            .text(fields::CHECKSUM, request.payload.checksum)
            .part(fields::CHUNK, part))
    }
}

impl ChunkTransport for HttpChunkTransport {
    fn send(&self, request: ChunkRequest, cancel: CancellationToken) -> TransportFuture<'_> {
        Box::pin(async move {
            let chunk_index = request.chunk_index();
            let form = Self::form(request)?;

            let resp = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                resp = self.http.post(&self.endpoint).multipart(form).send() => resp?,
            };
            let status = resp.status();
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                body = resp.bytes() => body?,
            };

            if !status.is_success() {
                let mut body = String::from_utf8_lossy(&body).into_owned();
                if body.len() > MAX_ERROR_BODY {
                    let mut end = MAX_ERROR_BODY;
                    while !body.is_char_boundary(end) {
                        end -= 1;
                    }
                    body.truncate(end);
                }
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let receipt = ChunkReceipt::from_body(chunk_index, &body);
            if !receipt.success {
                return Err(TransportError::Rejected(
                    receipt
                        .message
                        .unwrap_or_else(|| "endpoint reported failure".into()),
                ));
            }

            debug!(chunk_index, status = status.as_u16(), "chunk accepted");
            Ok(receipt)
        })
    }
}
