use std::fmt;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::plan::ChunkSpec;
use crate::{TransferError, checksum_bytes};

/// Boxed future returned by [`ContentSource::read_range`].
pub type ContentFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<u8>, TransferError>> + Send + 'a>>;

/// Random-access handle to a file's bytes.
///
/// Implementations must return exactly `len` bytes starting at `offset`,
/// or an error. Reads happen once per send attempt, so a source never
/// needs to hold more than one chunk in memory.
pub trait ContentSource: Send + Sync + fmt::Debug {
    fn read_range(&self, offset: u64, len: u64) -> ContentFuture<'_>;
}

// ---------------------------------------------------------------------------
// FileContent
// ---------------------------------------------------------------------------

/// Content backed by a file on disk, opened fresh for every read.
#[derive(Debug, Clone)]
pub struct FileContent {
    path: PathBuf,
}

impl FileContent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ContentSource for FileContent {
    fn read_range(&self, offset: u64, len: u64) -> ContentFuture<'_> {
        Box::pin(async move {
            let capacity = usize::try_from(len).map_err(std::io::Error::other)?;
            let mut file = tokio::fs::File::open(&self.path).await?;
            file.seek(SeekFrom::Start(offset)).await?;

            let mut buf = Vec::with_capacity(capacity);
            (&mut file).take(len).read_to_end(&mut buf).await?;

            // The file shrank after ingestion.
            if buf.len() as u64 != len {
                return Err(TransferError::ShortRead {
                    offset,
                    expected: len,
                    actual: buf.len() as u64,
                });
            }
            Ok(buf)
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryContent
// ---------------------------------------------------------------------------

/// Content held in shared memory (dropped blobs, tests).
#[derive(Clone)]
pub struct MemoryContent {
    data: Arc<[u8]>,
}

impl MemoryContent {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for MemoryContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryContent")
            .field("len", &self.data.len())
            .finish()
    }
}

impl ContentSource for MemoryContent {
    fn read_range(&self, offset: u64, len: u64) -> ContentFuture<'_> {
        let size = self.len();
        let slice = offset
            .checked_add(len)
            .filter(|end| *end <= size)
            .map(|end| self.data[offset as usize..end as usize].to_vec())
            .ok_or(TransferError::OutOfRange { offset, len, size });
        Box::pin(async move { slice })
    }
}

// ---------------------------------------------------------------------------
// ChunkPayload
// ---------------------------------------------------------------------------

/// Bytes of one chunk, sliced right before transport.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub spec: ChunkSpec,
    pub data: Vec<u8>,
    /// SHA-256 hex checksum of `data`.
    pub checksum: String,
}

impl ChunkPayload {
    /// Reads the chunk's byte range from `source` and checksums it.
    pub async fn load(source: &dyn ContentSource, spec: ChunkSpec) -> Result<Self, TransferError> {
        let data = source.read_range(spec.offset, spec.length).await?;
        let checksum = checksum_bytes(&data);
        Ok(Self {
            spec,
            data,
            checksum,
        })
    }
}
