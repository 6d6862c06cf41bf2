//! Record-aligned chunk planning
//!
//! A [`ChunkPlan`] splits the record region of a file into disjoint ranges
//! whose boundaries are multiples of the record size. Trailing bytes that
//! do not form a whole record are never part of a chunk; they are reported
//! through [`ChunkPlan::truncated_tail`].
//!
//! The plan is computed arithmetically and enumerated lazily, so planning a
//! very large file costs constant memory.

use hetl_common::{EtlError, Result};
use serde::{Deserialize, Serialize};

/// Half-open range `[start, end)` processed by one worker
///
/// For binary sources the offsets are absolute byte offsets. For text
/// sources they are data-row numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Bytes after the last whole record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TruncatedTail {
    /// Absolute offset of the first trailing byte
    pub offset: u64,
    pub bytes: u64,
}

/// Record-aligned division of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    base_offset: u64,
    region_len: u64,
    chunk_len: u64,
    record_size: u64,
    tail_bytes: u64,
}

/// Plan chunks for a file whose records start at byte 0
pub fn align(file_size: u64, record_size: usize, desired_chunk_size: u64) -> Result<ChunkPlan> {
    align_from(0, file_size, record_size, desired_chunk_size)
}

/// Plan chunks for a file whose record region starts at `base_offset`
///
/// Alignment is relative to `base_offset`. A file shorter than the base
/// has an empty region and no tail.
pub fn align_from(
    base_offset: u64,
    file_size: u64,
    record_size: usize,
    desired_chunk_size: u64,
) -> Result<ChunkPlan> {
    if record_size == 0 {
        return Err(EtlError::config("record_size must be greater than zero"));
    }
    let record_size = record_size as u64;
    let data_len = file_size.saturating_sub(base_offset);
    let records_per_chunk = (desired_chunk_size / record_size).max(1);

    Ok(ChunkPlan {
        base_offset,
        region_len: (data_len / record_size) * record_size,
        chunk_len: records_per_chunk * record_size,
        record_size,
        tail_bytes: data_len % record_size,
    })
}

impl ChunkPlan {
    /// Number of chunks in the plan
    pub fn len(&self) -> usize {
        self.region_len.div_ceil(self.chunk_len) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.region_len == 0
    }

    /// Whole records covered by the plan
    pub fn record_count(&self) -> u64 {
        self.region_len / self.record_size
    }

    /// Length of every chunk except possibly the last
    pub fn chunk_len(&self) -> u64 {
        self.chunk_len
    }

    pub fn record_size(&self) -> u64 {
        self.record_size
    }

    /// Byte range holding whole records
    pub fn region(&self) -> std::ops::Range<u64> {
        self.base_offset..self.base_offset + self.region_len
    }

    pub fn tail_bytes(&self) -> u64 {
        self.tail_bytes
    }

    pub fn truncated_tail(&self) -> Option<TruncatedTail> {
        (self.tail_bytes > 0).then(|| TruncatedTail {
            offset: self.base_offset + self.region_len,
            bytes: self.tail_bytes,
        })
    }

    /// Lazily enumerate chunks in file order
    pub fn chunks(&self) -> ChunkIter {
        ChunkIter {
            plan: *self,
            next_index: 0,
        }
    }
}

/// Iterator over the chunks of a [`ChunkPlan`]
#[derive(Debug, Clone)]
pub struct ChunkIter {
    plan: ChunkPlan,
    next_index: usize,
}

impl Iterator for ChunkIter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let relative = self.next_index as u64 * self.plan.chunk_len;
        if relative >= self.plan.region_len {
            return None;
        }
        let start = self.plan.base_offset + relative;
        let end = self.plan.base_offset + (relative + self.plan.chunk_len).min(self.plan.region_len);
        let chunk = Chunk {
            index: self.next_index,
            start,
            end,
        };
        self.next_index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.plan.len().saturating_sub(self.next_index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkIter {}
