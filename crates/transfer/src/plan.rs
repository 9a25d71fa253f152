use std::num::NonZeroU64;

use crate::TransferError;

/// One contiguous byte range of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkSpec {
    /// Zero-based position in the plan.
    pub index: u32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Number of bytes in this chunk.
    pub length: u64,
}

impl ChunkSpec {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Partition of `[0, total_size)` into fixed-size chunks.
///
/// Chunks are computed on demand; nothing is stored per chunk. Every chunk
/// has length `chunk_size` except possibly the last. An empty file has a
/// single zero-length chunk so the endpoint still receives one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: NonZeroU64,
    total_chunks: u32,
}

impl ChunkPlan {
    /// Builds the plan for a file of `total_size` bytes.
    pub fn new(total_size: u64, chunk_size: NonZeroU64) -> Result<Self, TransferError> {
        let count = if total_size == 0 {
            1
        } else {
            total_size.div_ceil(chunk_size.get())
        };
        let total_chunks = u32::try_from(count).map_err(|_| TransferError::TooManyChunks {
            total_size,
            max: u32::MAX,
        })?;
        Ok(Self {
            total_size,
            chunk_size,
            total_chunks,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> NonZeroU64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Returns the spec of chunk `index`, or `None` past the end.
    pub fn get(&self, index: u32) -> Option<ChunkSpec> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = u64::from(index) * self.chunk_size.get();
        let length = self
            .chunk_size
            .get()
            .min(self.total_size.saturating_sub(offset));
        Some(ChunkSpec {
            index,
            offset,
            length,
        })
    }

    /// Iterates the plan from the first chunk. Each call starts over.
    pub fn iter(&self) -> ChunkIter {
        ChunkIter {
            plan: *self,
            next: 0,
        }
    }
}

impl IntoIterator for &ChunkPlan {
    type Item = ChunkSpec;
    type IntoIter = ChunkIter;

    fn into_iter(self) -> ChunkIter {
        self.iter()
    }
}

/// Lazy, finite iterator over a [`ChunkPlan`].
#[derive(Debug, Clone)]
pub struct ChunkIter {
    plan: ChunkPlan,
    next: u32,
}

impl Iterator for ChunkIter {
    type Item = ChunkSpec;

    fn next(&mut self) -> Option<ChunkSpec> {
        let spec = self.plan.get(self.next)?;
        self.next += 1;
        Some(spec)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.plan.total_chunks - self.next) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ChunkIter {}
