//! Chunks and allocation tokens.
//!
//! A chunk is one buddy arena placed at a fixed offset of the backing store.
//! Tokens name an allocation inside a chunk and are the only way to free it.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::arena::{ArenaError, BuddyArena};

/// Index of a chunk inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u32);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk{}", self.0)
    }
}

/// Lifecycle of a chunk slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    /// Serving allocations.
    Live,
    /// Empty and parked for reuse.
    Retired,
}

/// One live memory allocation.
///
/// Move-only: handing it to [`ChunkPool::deferred_free`](crate::pool::ChunkPool::deferred_free)
/// consumes it, so it can't be read or freed twice.
#[derive(Debug, PartialEq, Eq)]
pub struct AllocationToken {
    chunk_id: ChunkId,
    offset_in_chunk: u64,
    global_offset: u64,
    size: u64,
    alignment: u64,
}

impl AllocationToken {
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn offset_in_chunk(&self) -> u64 {
        self.offset_in_chunk
    }

    /// Offset inside the backing store.
    pub fn global_offset(&self) -> u64 {
        self.global_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Backing-store byte range of the allocation.
    pub fn range(&self) -> Range<u64> {
        self.global_offset..self.global_offset + self.size
    }
}

#[derive(Debug)]
pub(crate) struct Chunk {
    id: ChunkId,
    offset: u64,
    arena: BuddyArena,
    state: ChunkState,
}

impl Chunk {
    pub(crate) fn new(id: ChunkId, offset: u64, order: u32) -> Self {
        Self {
            id,
            offset,
            arena: BuddyArena::new(order),
            state: ChunkState::Live,
        }
    }

    pub(crate) fn id(&self) -> ChunkId {
        self.id
    }

    /// Offset of the chunk inside the backing store.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn arena(&self) -> &BuddyArena {
        &self.arena
    }

    pub(crate) fn state(&self) -> ChunkState {
        self.state
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state == ChunkState::Live
    }

    /// Whether an allocation with a block of `block_size` bytes would succeed.
    pub(crate) fn has_room(&self, block_size: u64) -> bool {
        self.is_live() && self.arena.largest_free_block() >= block_size
    }

    pub(crate) fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
    ) -> Result<AllocationToken, ArenaError> {
        debug_assert!(self.is_live(), "allocation from retired {}", self.id);
        let offset_in_chunk = self.arena.allocate(size, alignment)?;
        Ok(AllocationToken {
            chunk_id: self.id,
            offset_in_chunk,
            global_offset: self.offset + offset_in_chunk,
            size,
            alignment,
        })
    }

    pub(crate) fn free(&mut self, token: AllocationToken) {
        debug_assert_eq!(token.chunk_id, self.id);
        debug_assert_eq!(token.global_offset, self.offset + token.offset_in_chunk);
        self.arena
            .free(token.offset_in_chunk, token.size, token.alignment);
    }

    /// Park an empty chunk for reuse.
    pub(crate) fn retire(&mut self) {
        debug_assert!(self.arena.is_empty());
        self.arena.reset();
        self.state = ChunkState::Retired;
    }

    pub(crate) fn revive(&mut self) {
        debug_assert_eq!(self.state, ChunkState::Retired);
        self.state = ChunkState::Live;
    }
}
