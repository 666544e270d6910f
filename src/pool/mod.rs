//! Chunk pool: growable sub-allocation with fence-deferred reclamation.

pub mod chunk;
pub mod chunk_pool;
pub mod deferred;
pub mod garbage;
pub mod stats;

pub use chunk::{AllocationToken, ChunkId, ChunkState};
pub use chunk_pool::{ChunkPool, PoolError, SharedPool};
pub use deferred::FencedQueue;
pub use garbage::{EpochDrain, GarbageCollector};
pub use stats::{EpochReport, PoolStats};

use std::sync::Arc;

use crate::config::PoolConfig;
use crate::gpu::{BackingStoreProvider, CopyEngine};

/// Create a pool behind an `Arc` for sharing across threads.
pub fn new_shared_pool(
    config: PoolConfig,
    provider: Arc<dyn BackingStoreProvider>,
    copier: Arc<dyn CopyEngine>,
) -> Result<SharedPool, PoolError> {
    Ok(Arc::new(ChunkPool::new(config, provider, copier)?))
}
