//! Splitting of a rank's requests into bounded transfers.

use crate::error::{Error, Result};
use crate::types::WireTag;
use std::ops::Range;

/// One transfer's slice of a rank's requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Position in sending order, from 0.
    pub index: usize,
    /// Offset of the first request.
    pub offset: usize,
    /// Number of requests.
    pub len: usize,
    /// Wire tag: the number of chunks remaining including this one.
    pub tag: WireTag,
}

impl Chunk {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Partition of `total` requests into chunks of at most `capacity`.
///
/// Every chunk is full except possibly the last. Tags count down from the
/// number of chunks to 1, so the receiver can match chunk `i` of a sender by
/// tag alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total: usize,
    capacity: usize,
}

impl ChunkPlan {
    pub fn new(total: usize, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("chunk capacity must be at least 1".into()));
        }
        Ok(Self { total, capacity })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of chunks: `ceil(total / capacity)`.
    pub fn count(&self) -> usize {
        self.total.div_ceil(self.capacity)
    }

    pub fn chunk(&self, index: usize) -> Option<Chunk> {
        let count = self.count();
        if index >= count {
            return None;
        }
        let offset = index * self.capacity;
        Some(Chunk {
            index,
            offset,
            len: self.capacity.min(self.total - offset),
            tag: (count - index) as WireTag,
        })
    }

    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        (0..self.count()).filter_map(move |i| self.chunk(i))
    }
}
