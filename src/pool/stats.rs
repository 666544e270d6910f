//! Pool statistics.

use serde::{Deserialize, Serialize};

/// Aggregate pool usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Current backing store size in bytes (0 before the first allocation).
    pub backing_store_size: u64,

    /// Size of every chunk.
    pub chunk_size: u64,

    /// Chunk slots created so far.
    pub chunk_count: usize,

    pub live_chunks: usize,

    pub retired_chunks: usize,

    /// Bytes requested by callers and not yet reclaimed (pending frees included).
    pub user_allocated_bytes: u64,

    /// Bytes held by granted blocks, rounding and padding included.
    pub real_allocated_bytes: u64,

    /// Free arena bytes plus the backing-store tail not yet cut into chunks.
    pub free_bytes: u64,

    /// Allocations handed to `deferred_free` and not yet reclaimed.
    pub pending_free_allocations: usize,

    pub pending_free_bytes: u64,

    /// Garbage buckets sealed and waiting on their fence.
    pub pending_buckets: usize,

    /// Replaced backing stores waiting on their copy fence.
    pub retired_backing_stores: usize,

    /// Number of copy-on-write growths.
    pub growth_count: u64,

    /// `1 - largest free block / free bytes` across the whole pool.
    pub external_fragmentation: f64,

    /// `1 - user_allocated_bytes / real_allocated_bytes` over all chunks.
    pub internal_fragmentation: f64,
}

impl PoolStats {
    /// Fraction of the backing store held by granted blocks.
    pub fn utilization(&self) -> f64 {
        if self.backing_store_size == 0 {
            return 0.0;
        }
        self.real_allocated_bytes as f64 / self.backing_store_size as f64
    }
}

/// What one [`end_epoch`](crate::pool::ChunkPool::end_epoch) call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochReport {
    /// Allocations returned to their arenas.
    pub reclaimed_allocations: usize,

    pub reclaimed_bytes: u64,

    /// Whether the active bucket was sealed with the supplied fence.
    pub sealed: bool,

    /// Replaced backing stores destroyed.
    pub released_backing_stores: usize,

    /// Chunks that became empty and were retired.
    pub retired_chunks: usize,
}
