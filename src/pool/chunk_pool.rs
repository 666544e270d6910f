//! Growable chunk pool over one backing store.
//!
//! The backing store is cut into equal chunks, each with its own buddy arena.
//! When no live chunk can serve a request the growth controller, in order:
//! creates the store, reuses a retired chunk, cuts a chunk from the unused
//! tail, or doubles the store by copy-on-write. Frees are deferred until the
//! GPU is done with the memory (see [`garbage`](crate::pool::garbage)).
//!
//! Every operation takes one pool-wide lock. Sub-allocation is rare compared
//! to per-draw work, so contention is not a concern.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::arena::{ArenaError, BuddyArena};
use crate::config::PoolConfig;
use crate::gpu::backing::{BackingHandle, BackingStoreError, BackingStoreProvider};
use crate::gpu::fence::{FenceSet, SharedFence};
use crate::gpu::transfer::{CopyEngine, TransferError};
use crate::pool::chunk::{AllocationToken, Chunk, ChunkId, ChunkState};
use crate::pool::deferred::FencedQueue;
use crate::pool::garbage::GarbageCollector;
use crate::pool::stats::{EpochReport, PoolStats};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Out of GPU memory: cannot allocate {size} bytes aligned to {alignment} (backing store {backing_store_size} bytes)")]
    OutOfMemory {
        size: u64,
        alignment: u64,
        backing_store_size: u64,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Copy-on-write growth failed, pool is unusable")]
    GrowthTransferFailed(#[source] TransferError),

    #[error("Pool is unusable after a failed growth or shutdown")]
    Unusable,

    #[error("{pending} fences did not signal before the shutdown timeout")]
    FenceTimeout { pending: usize },

    #[error(transparent)]
    Backing(#[from] BackingStoreError),

    #[error("Pool bookkeeping corrupted: {0}")]
    Corrupted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolStatus {
    Active,
    /// A growth copy failed; the backing store may be inconsistent.
    Unusable,
    ShutDown,
}

struct PoolState {
    status: PoolStatus,

    /// Current backing store, absent until the first allocation.
    store: Option<BackingHandle>,

    store_size: u64,

    /// Chunk slots; the chunk at index `i` sits at offset `i * chunk_size`.
    chunks: Vec<Chunk>,

    /// Indices of retired chunks.
    retired: Vec<usize>,

    garbage: GarbageCollector,

    /// Stores replaced during the current epoch, with their copy fence.
    /// Work recorded earlier in the epoch may still read them.
    replaced_stores: Vec<(SharedFence, BackingHandle)>,

    /// Replaced stores waiting on both their copy and their epoch.
    retired_stores: FencedQueue<BackingHandle>,

    growth_count: u64,
}

impl PoolState {
    fn new() -> Self {
        Self {
            status: PoolStatus::Active,
            store: None,
            store_size: 0,
            chunks: Vec::new(),
            retired: Vec::new(),
            garbage: GarbageCollector::new(),
            replaced_stores: Vec::new(),
            retired_stores: FencedQueue::new(),
            growth_count: 0,
        }
    }

    /// Return a token's memory to its arena. Retires the chunk once empty.
    fn release(&mut self, token: AllocationToken) -> bool {
        let idx = token.chunk_id().0 as usize;
        let Some(chunk) = self.chunks.get_mut(idx) else {
            debug_assert!(false, "token for unknown {}", token.chunk_id());
            return false;
        };

        chunk.free(token);
        if chunk.is_live() && chunk.arena().is_empty() {
            chunk.retire();
            self.retired.push(idx);
            debug!(chunk = %chunk.id(), offset = chunk.offset(), "Retired empty chunk");
            return true;
        }
        false
    }

    fn retired_store_count(&self) -> usize {
        self.replaced_stores.len() + self.retired_stores.len()
    }

    fn live_user_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .map(|c| c.arena().user_allocated_bytes())
            .sum()
    }
}

/// Sub-allocator over a growable device buffer.
pub struct ChunkPool {
    config: PoolConfig,
    provider: Arc<dyn BackingStoreProvider>,
    copier: Arc<dyn CopyEngine>,
    state: Mutex<PoolState>,
}

/// Thread-safe shared pool.
pub type SharedPool = Arc<ChunkPool>;

impl ChunkPool {
    /// Create a pool. No device memory is requested until the first allocation.
    pub fn new(
        config: PoolConfig,
        provider: Arc<dyn BackingStoreProvider>,
        copier: Arc<dyn CopyEngine>,
    ) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        Ok(Self {
            config,
            provider,
            copier,
            state: Mutex::new(PoolState::new()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn chunk_size(&self) -> u64 {
        self.config.chunk_size()
    }

    /// Current backing store, if created.
    pub fn backing_store(&self) -> Option<BackingHandle> {
        self.state.lock().store
    }

    /// Allocate `size` bytes aligned to `alignment` (a power of two).
    pub fn allocate(&self, size: u64, alignment: u64) -> Result<AllocationToken, PoolError> {
        let block_size = self.check_request(size, alignment)?;

        let mut state = self.state.lock();
        if state.status != PoolStatus::Active {
            return Err(PoolError::Unusable);
        }

        for chunk in state.chunks.iter_mut() {
            if !chunk.has_room(block_size) {
                continue;
            }
            match chunk.allocate(size, alignment) {
                Ok(token) => return Ok(token),
                Err(ArenaError::OutOfSpace { .. }) => continue,
                Err(e) => return Err(PoolError::InvalidRequest(e.to_string())),
            }
        }

        let idx = self.acquire_chunk(&mut state, size, alignment)?;
        let backing_store_size = state.store_size;
        state.chunks[idx].allocate(size, alignment).map_err(|e| {
            debug_assert!(false, "fresh chunk could not serve a validated request: {e}");
            PoolError::OutOfMemory {
                size,
                alignment,
                backing_store_size,
            }
        })
    }

    /// Hand an allocation over for reclamation once the current epoch's GPU
    /// work is done. The memory stays reserved until then.
    pub fn deferred_free(&self, token: AllocationToken) {
        let mut state = self.state.lock();
        if state.status == PoolStatus::ShutDown {
            // The store is gone; nothing left to return the range to.
            debug!(offset = token.global_offset(), "Free after shutdown dropped");
            return;
        }
        debug_assert!(
            state
                .chunks
                .get(token.chunk_id().0 as usize)
                .is_some_and(Chunk::is_live),
            "free of a token whose chunk is not live"
        );
        state.garbage.defer(token);
    }

    /// Mark an epoch boundary.
    ///
    /// Reclaims every sealed bucket whose fence has signaled, destroys
    /// replaced backing stores whose copy and epoch both completed, then
    /// seals the current bucket and this epoch's replaced stores with
    /// `fence`. The only place freed memory becomes reusable.
    pub fn end_epoch(&self, fence: SharedFence) -> EpochReport {
        let mut state = self.state.lock();
        let mut report = EpochReport::default();

        let drain = state.garbage.end_epoch(fence.clone());
        report.sealed = drain.sealed;
        for token in drain.reclaimable {
            report.reclaimed_allocations += 1;
            report.reclaimed_bytes += token.size();
            if state.release(token) {
                report.retired_chunks += 1;
            }
        }

        for handle in state.retired_stores.drain_signaled() {
            self.provider.destroy(handle);
            report.released_backing_stores += 1;
            debug!(handle = %handle, "Released replaced backing store");
        }

        for (copy, handle) in std::mem::take(&mut state.replaced_stores) {
            state
                .retired_stores
                .push(FenceSet::new(vec![copy, fence.clone()]), handle);
        }

        report
    }

    /// Write `data` into an allocation at `offset` through the CPU mapping.
    pub fn write(
        &self,
        token: &AllocationToken,
        offset: u64,
        data: &[u8],
    ) -> Result<(), PoolError> {
        check_access(token, offset, data.len())?;
        // Holding the lock keeps the write from racing a growth copy.
        let state = self.state.lock();
        let store = usable_store(&state)?;
        self.provider
            .write(store, token.global_offset() + offset, data)?;
        Ok(())
    }

    /// Read an allocation's bytes at `offset` through the CPU mapping.
    pub fn read(
        &self,
        token: &AllocationToken,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), PoolError> {
        check_access(token, offset, out.len())?;
        let state = self.state.lock();
        let store = usable_store(&state)?;
        self.provider
            .read(store, token.global_offset() + offset, out)?;
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let chunk_size = self.config.chunk_size();

        let mut stats = PoolStats {
            backing_store_size: state.store_size,
            chunk_size,
            chunk_count: state.chunks.len(),
            retired_chunks: state.retired.len(),
            pending_free_allocations: state.garbage.pending_allocations(),
            pending_free_bytes: state.garbage.pending_bytes(),
            pending_buckets: state.garbage.sealed_buckets(),
            retired_backing_stores: state.retired_store_count(),
            growth_count: state.growth_count,
            ..Default::default()
        };
        stats.live_chunks = stats.chunk_count - stats.retired_chunks;

        let chunked = state.chunks.len() as u64 * chunk_size;
        let tail = state.store_size.saturating_sub(chunked);
        let mut free = tail;
        // The unchunked tail can serve at most one chunk-sized block.
        let mut largest = tail.min(chunk_size);
        for chunk in &state.chunks {
            let arena = chunk.arena();
            stats.user_allocated_bytes += arena.user_allocated_bytes();
            stats.real_allocated_bytes += arena.real_allocated_bytes();
            free += arena.free_bytes();
            largest = largest.max(arena.largest_free_block());
        }
        stats.free_bytes = free;
        if free > 0 {
            stats.external_fragmentation = 1.0 - largest as f64 / free as f64;
        }
        if stats.real_allocated_bytes > 0 {
            stats.internal_fragmentation =
                1.0 - stats.user_allocated_bytes as f64 / stats.real_allocated_bytes as f64;
        }

        stats
    }

    /// Check every arena and the pool-wide accounting. Expensive.
    pub fn validate(&self) -> Result<(), PoolError> {
        let state = self.state.lock();
        let chunk_size = self.config.chunk_size();

        for (idx, chunk) in state.chunks.iter().enumerate() {
            if chunk.id().0 as usize != idx || chunk.offset() != idx as u64 * chunk_size {
                return Err(PoolError::Corrupted(format!(
                    "{} misplaced at offset {}",
                    chunk.id(),
                    chunk.offset()
                )));
            }
            chunk
                .arena()
                .validate()
                .map_err(|e| PoolError::Corrupted(format!("{}: {e}", chunk.id())))?;
            if chunk.state() == ChunkState::Retired && !chunk.arena().is_empty() {
                return Err(PoolError::Corrupted(format!(
                    "retired {} holds allocations",
                    chunk.id()
                )));
            }
            if chunk.arena().capacity() != chunk_size {
                return Err(PoolError::Corrupted(format!(
                    "{} spans {} bytes, expected {chunk_size}",
                    chunk.id(),
                    chunk.arena().capacity()
                )));
            }
        }

        let chunked = state.chunks.len() as u64 * chunk_size;
        if chunked > state.store_size {
            return Err(PoolError::Corrupted(format!(
                "{chunked} chunked bytes exceed backing store of {}",
                state.store_size
            )));
        }

        let user = state.live_user_bytes();
        if state.garbage.pending_bytes() > user {
            return Err(PoolError::Corrupted(format!(
                "pending frees ({} bytes) exceed allocated bytes ({user})",
                state.garbage.pending_bytes()
            )));
        }
        for token in state.garbage.iter_pending() {
            if !state
                .chunks
                .get(token.chunk_id().0 as usize)
                .is_some_and(Chunk::is_live)
            {
                return Err(PoolError::Corrupted(format!(
                    "pending free at {} references a retired chunk",
                    token.global_offset()
                )));
            }
        }

        Ok(())
    }

    /// Tear the pool down.
    ///
    /// Waits up to `timeout` for every outstanding fence, then reclaims all
    /// pending frees and destroys every backing store. On timeout nothing is
    /// released and `FenceTimeout` is returned, so the call can be retried.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if state.status == PoolStatus::ShutDown {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let unfinished_copies = state
            .replaced_stores
            .iter()
            .filter(|(copy, _)| {
                !copy.client_wait(deadline.saturating_duration_since(Instant::now()))
            })
            .count();
        let pending = state.garbage.wait_until(deadline)
            + state.retired_stores.wait_until(deadline)
            + unfinished_copies;
        if pending > 0 {
            return Err(PoolError::FenceTimeout { pending });
        }

        for token in state.garbage.drain_all() {
            state.release(token);
        }
        let replaced = std::mem::take(&mut state.replaced_stores);
        for handle in replaced
            .into_iter()
            .map(|(_, handle)| handle)
            .chain(state.retired_stores.drain_all())
        {
            self.provider.destroy(handle);
        }

        let leaked = state.live_user_bytes();
        if leaked > 0 {
            warn!(bytes = leaked, "Pool shut down with GPU memory still allocated");
        }

        if let Some(store) = state.store.take() {
            self.provider.destroy(store);
        }
        state.chunks.clear();
        state.retired.clear();
        state.status = PoolStatus::ShutDown;

        info!(
            growths = state.growth_count,
            size = state.store_size,
            "Pool shut down"
        );
        state.store_size = 0;
        Ok(())
    }

    /// Validate a request and return the block size it needs.
    fn check_request(&self, size: u64, alignment: u64) -> Result<u64, PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidRequest("zero-sized allocation".to_string()));
        }
        if !alignment.is_power_of_two() {
            return Err(PoolError::InvalidRequest(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        let chunk_order = self.config.chunk_order;
        match BuddyArena::block_order(size, alignment) {
            Some((order, _)) if order <= chunk_order => Ok(1u64 << order),
            _ => Err(PoolError::InvalidRequest(format!(
                "{size} bytes aligned to {alignment} cannot fit a {} byte chunk",
                self.config.chunk_size()
            ))),
        }
    }

    /// Find or make an empty live chunk. Returns its index.
    fn acquire_chunk(
        &self,
        state: &mut PoolState,
        size: u64,
        alignment: u64,
    ) -> Result<usize, PoolError> {
        let chunk_size = self.config.chunk_size();

        if state.store.is_none() {
            let initial = self.config.initial_size;
            let handle = self
                .provider
                .create(initial)
                .map_err(|e| out_of_memory(e, size, alignment, 0))?;
            state.store = Some(handle);
            state.store_size = initial;
            info!(handle = %handle, size = initial, chunk_size, "Created backing store");
            return Ok(self.push_chunk(state));
        }

        if let Some(idx) = state.retired.pop() {
            let chunk = &mut state.chunks[idx];
            chunk.revive();
            debug!(chunk = %chunk.id(), offset = chunk.offset(), "Reused retired chunk");
            return Ok(idx);
        }

        let chunked = state.chunks.len() as u64 * chunk_size;
        if chunked + chunk_size > state.store_size {
            self.grow(state, size, alignment)?;
        }
        Ok(self.push_chunk(state))
    }

    /// Append a chunk right after the last one.
    fn push_chunk(&self, state: &mut PoolState) -> usize {
        let idx = state.chunks.len();
        let offset = idx as u64 * self.config.chunk_size();
        debug_assert!(offset + self.config.chunk_size() <= state.store_size);

        state
            .chunks
            .push(Chunk::new(ChunkId(idx as u32), offset, self.config.chunk_order));
        debug!(chunk = idx, offset, "Created chunk");
        idx
    }

    /// Double the backing store by copy-on-write.
    ///
    /// The old store is kept alive behind the copy's fence, so GPU work still
    /// reading it stays valid.
    fn grow(&self, state: &mut PoolState, size: u64, alignment: u64) -> Result<(), PoolError> {
        let old_size = state.store_size;
        let oom = PoolError::OutOfMemory {
            size,
            alignment,
            backing_store_size: old_size,
        };

        if !self.config.allow_growth {
            return Err(oom);
        }
        let Some(new_size) = old_size.checked_mul(2) else {
            return Err(oom);
        };
        if self.config.max_size.is_some_and(|max| new_size > max) {
            return Err(oom);
        }
        let Some(old) = state.store else {
            return Err(oom);
        };

        let new = self
            .provider
            .create(new_size)
            .map_err(|e| out_of_memory(e, size, alignment, old_size))?;

        match self.copier.copy(old, new, 0..old_size) {
            Ok(fence) => {
                state.store = Some(new);
                state.store_size = new_size;
                state.replaced_stores.push((fence, old));
                state.growth_count += 1;
                info!(
                    old = %old,
                    new = %new,
                    old_size,
                    new_size,
                    "Grew backing store"
                );
                Ok(())
            }
            Err(e) => {
                self.provider.destroy(new);
                state.status = PoolStatus::Unusable;
                warn!(error = %e, old_size, new_size, "Backing store growth copy failed");
                Err(PoolError::GrowthTransferFailed(e))
            }
        }
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.status == PoolStatus::ShutDown {
            return;
        }

        let pending = state.garbage.pending_allocations();
        let live = state.live_user_bytes();
        if pending > 0 || live > 0 || state.retired_store_count() > 0 {
            warn!(
                pending_frees = pending,
                live_bytes = live,
                "Pool dropped without shutdown"
            );
        }

        for (_, handle) in state.replaced_stores.drain(..) {
            self.provider.destroy(handle);
        }
        for handle in state.retired_stores.drain_all() {
            self.provider.destroy(handle);
        }
        if let Some(store) = state.store.take() {
            self.provider.destroy(store);
        }
    }
}

fn out_of_memory(err: BackingStoreError, size: u64, alignment: u64, current: u64) -> PoolError {
    match err {
        BackingStoreError::OutOfDeviceMemory { .. } => PoolError::OutOfMemory {
            size,
            alignment,
            backing_store_size: current,
        },
        other => PoolError::Backing(other),
    }
}

fn check_access(token: &AllocationToken, offset: u64, len: usize) -> Result<(), PoolError> {
    let in_bounds = offset
        .checked_add(len as u64)
        .is_some_and(|end| end <= token.size());
    if in_bounds {
        Ok(())
    } else {
        Err(PoolError::InvalidRequest(format!(
            "access of {len} bytes at {offset} outside a {} byte allocation",
            token.size()
        )))
    }
}

fn usable_store(state: &PoolState) -> Result<BackingHandle, PoolError> {
    match (state.status, state.store) {
        (PoolStatus::Active, Some(store)) => Ok(store),
        _ => Err(PoolError::Unusable),
    }
}
