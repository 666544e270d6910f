//! Host-RAM backend.
//!
//! Implements both collaborator contracts on plain byte vectors so the pool
//! can run without a GPU: tests, benches and the simulator use it. Copies
//! execute synchronously and return an already signaled fence. An optional
//! budget makes `create` fail the way a device does when VRAM runs out.

use std::collections::HashMap;
use std::ops::Range;

use parking_lot::Mutex;
use tracing::debug;

use crate::gpu::backing::{BackingHandle, BackingStoreError, BackingStoreProvider};
use crate::gpu::fence::{ManualFence, SharedFence};
use crate::gpu::transfer::{CopyEngine, TransferError, TransferStats};

#[derive(Debug, Default)]
struct HostState {
    stores: HashMap<BackingHandle, Vec<u8>>,
    next_id: u64,
    bytes_in_use: u64,
    budget: Option<u64>,
    fail_copies: bool,
    transfer_stats: TransferStats,
}

impl HostState {
    fn store(&self, handle: BackingHandle) -> Result<&Vec<u8>, BackingStoreError> {
        self.stores
            .get(&handle)
            .ok_or(BackingStoreError::UnknownHandle(handle))
    }

    fn store_mut(&mut self, handle: BackingHandle) -> Result<&mut Vec<u8>, BackingStoreError> {
        self.stores
            .get_mut(&handle)
            .ok_or(BackingStoreError::UnknownHandle(handle))
    }
}

fn checked_range(
    handle: BackingHandle,
    size: usize,
    offset: u64,
    len: usize,
) -> Result<Range<usize>, BackingStoreError> {
    let out_of_bounds = BackingStoreError::OutOfBounds {
        handle,
        offset,
        len: len as u64,
        size: size as u64,
    };
    let start = usize::try_from(offset).map_err(|_| out_of_bounds.clone())?;
    let end = start.checked_add(len).ok_or(out_of_bounds.clone())?;
    if end > size {
        return Err(out_of_bounds);
    }
    Ok(start..end)
}

/// Backing stores in host memory.
#[derive(Debug, Default)]
pub struct HostMemory {
    state: Mutex<HostState>,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the total bytes of live stores.
    pub fn with_budget(budget: u64) -> Self {
        let memory = Self::default();
        memory.state.lock().budget = Some(budget);
        memory
    }

    /// Make every following copy fail at submission.
    pub fn set_fail_copies(&self, fail: bool) {
        self.state.lock().fail_copies = fail;
    }

    /// Number of stores created and not yet destroyed.
    pub fn live_stores(&self) -> usize {
        self.state.lock().stores.len()
    }

    /// Total bytes of live stores.
    pub fn bytes_in_use(&self) -> u64 {
        self.state.lock().bytes_in_use
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.state.lock().transfer_stats
    }

    /// Whether `handle` is still alive.
    pub fn contains(&self, handle: BackingHandle) -> bool {
        self.state.lock().stores.contains_key(&handle)
    }
}

impl BackingStoreProvider for HostMemory {
    fn create(&self, size: u64) -> Result<BackingHandle, BackingStoreError> {
        let mut state = self.state.lock();

        if let Some(budget) = state.budget {
            if state.bytes_in_use + size > budget {
                return Err(BackingStoreError::OutOfDeviceMemory { requested: size });
            }
        }
        let len = usize::try_from(size)
            .map_err(|_| BackingStoreError::OutOfDeviceMemory { requested: size })?;

        let handle = BackingHandle(state.next_id);
        state.next_id += 1;
        state.stores.insert(handle, vec![0u8; len]);
        state.bytes_in_use += size;

        debug!(handle = %handle, size, "Created host backing store");
        Ok(handle)
    }

    fn destroy(&self, handle: BackingHandle) {
        let mut state = self.state.lock();
        if let Some(store) = state.stores.remove(&handle) {
            state.bytes_in_use -= store.len() as u64;
            debug!(handle = %handle, size = store.len(), "Destroyed host backing store");
        }
    }

    fn size(&self, handle: BackingHandle) -> Option<u64> {
        self.state
            .lock()
            .stores
            .get(&handle)
            .map(|s| s.len() as u64)
    }

    fn write(
        &self,
        handle: BackingHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackingStoreError> {
        let mut state = self.state.lock();
        let store = state.store_mut(handle)?;
        let range = checked_range(handle, store.len(), offset, data.len())?;
        store[range].copy_from_slice(data);
        Ok(())
    }

    fn read(
        &self,
        handle: BackingHandle,
        offset: u64,
        out: &mut [u8],
    ) -> Result<(), BackingStoreError> {
        let state = self.state.lock();
        let store = state.store(handle)?;
        let range = checked_range(handle, store.len(), offset, out.len())?;
        out.copy_from_slice(&store[range]);
        Ok(())
    }
}

impl CopyEngine for HostMemory {
    fn copy(
        &self,
        src: BackingHandle,
        dst: BackingHandle,
        range: Range<u64>,
    ) -> Result<SharedFence, TransferError> {
        let mut state = self.state.lock();

        if state.fail_copies {
            state.transfer_stats.failed_copies += 1;
            return Err(TransferError::SubmitFailed(
                "host copy queue rejected the submission".to_string(),
            ));
        }

        let len = usize::try_from(range.end.saturating_sub(range.start))
            .map_err(|_| TransferError::SubmitFailed("copy too large".to_string()))?;

        let src_store = state.store(src)?;
        let src_range = checked_range(src, src_store.len(), range.start, len)?;
        let bytes = src_store[src_range].to_vec();

        let dst_store = state.store_mut(dst)?;
        if range.end > dst_store.len() as u64 {
            return Err(TransferError::RangeOutOfBounds {
                start: range.start,
                end: range.end,
                dst_size: dst_store.len() as u64,
            });
        }
        let dst_range = checked_range(dst, dst_store.len(), range.start, len)?;
        dst_store[dst_range].copy_from_slice(&bytes);

        state.transfer_stats.total_copies += 1;
        state.transfer_stats.total_bytes += len as u64;

        debug!(
            src = %src,
            dst = %dst,
            start = range.start,
            end = range.end,
            "Host store copy"
        );

        Ok(ManualFence::signaled_now())
    }
}
