//! Integration tests for the chunk pool: deferred reuse, growth, failures.

use std::ops::Range;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use gpu_suballoc::config::PoolConfig;
use gpu_suballoc::gpu::{
    BackingHandle, CopyEngine, ManualFence, SharedFence, HostMemory, TransferError,
};
use gpu_suballoc::pool::{ChunkPool, PoolError};

const KIB: u64 = 1024;
const CHUNK: u64 = 64 * KIB;

fn config(chunks: u64, allow_growth: bool) -> PoolConfig {
    PoolConfig {
        initial_size: chunks * CHUNK,
        chunk_order: 16,
        allow_growth,
        max_size: None,
        shutdown_timeout_ms: 50,
    }
}

fn host_pool(config: PoolConfig) -> (ChunkPool, Arc<HostMemory>) {
    let memory = Arc::new(HostMemory::new());
    let pool = ChunkPool::new(config, memory.clone(), memory.clone()).unwrap();
    (pool, memory)
}

/// Copies through host memory but reports completion only when told to.
struct SlowCopies {
    memory: Arc<HostMemory>,
    fences: Mutex<Vec<Arc<ManualFence>>>,
}

impl SlowCopies {
    fn complete_all(&self) {
        for fence in self.fences.lock().iter() {
            fence.signal();
        }
    }
}

impl CopyEngine for SlowCopies {
    fn copy(
        &self,
        src: BackingHandle,
        dst: BackingHandle,
        range: Range<u64>,
    ) -> Result<SharedFence, TransferError> {
        self.memory.copy(src, dst, range)?;
        let fence = ManualFence::new();
        self.fences.lock().push(fence.clone());
        Ok(fence)
    }
}

#[test]
fn test_deferred_free_is_not_reused_before_fence() {
    let (pool, _memory) = host_pool(config(1, false));

    let a = pool.allocate(4096, 16).unwrap();
    let a_offset = a.global_offset();
    pool.deferred_free(a);

    let b = pool.allocate(4096, 16).unwrap();
    assert_ne!(b.global_offset(), a_offset);

    let fence = ManualFence::new();
    let report = pool.end_epoch(fence.clone());
    assert!(report.sealed);
    assert_eq!(report.reclaimed_allocations, 0);

    let c = pool.allocate(4096, 16).unwrap();
    assert_ne!(c.global_offset(), a_offset);

    fence.signal();
    let report = pool.end_epoch(ManualFence::new());
    assert_eq!(report.reclaimed_allocations, 1);
    assert_eq!(report.reclaimed_bytes, 4096);

    let d = pool.allocate(4096, 16).unwrap();
    assert_eq!(d.global_offset(), a_offset);
    pool.validate().unwrap();
}

#[test]
fn test_empty_epoch_keeps_bucket_active() {
    let (pool, _memory) = host_pool(config(1, false));
    let report = pool.end_epoch(ManualFence::new());
    assert!(!report.sealed);
    assert_eq!(pool.stats().pending_buckets, 0);
}

#[test]
fn test_out_of_order_fence_completion() {
    let (pool, _memory) = host_pool(config(1, false));
    let a = pool.allocate(1000, 8).unwrap();
    let b = pool.allocate(2000, 8).unwrap();

    let epoch1 = ManualFence::new();
    pool.deferred_free(a);
    pool.end_epoch(epoch1.clone());

    let epoch2 = ManualFence::new();
    pool.deferred_free(b);
    pool.end_epoch(epoch2.clone());
    assert_eq!(pool.stats().pending_buckets, 2);

    epoch2.signal();
    let report = pool.end_epoch(ManualFence::new());
    assert_eq!(report.reclaimed_allocations, 1);
    assert_eq!(report.reclaimed_bytes, 2000);

    let stats = pool.stats();
    assert_eq!(stats.pending_free_allocations, 1);
    assert_eq!(stats.pending_free_bytes, 1000);

    epoch1.signal();
    let report = pool.end_epoch(ManualFence::new());
    assert_eq!(report.reclaimed_bytes, 1000);
    assert_eq!(pool.stats().user_allocated_bytes, 0);
}

#[test]
fn test_growth_preserves_contents() {
    let (pool, memory) = host_pool(config(1, true));

    let first = pool.allocate(CHUNK, 256).unwrap();
    let pattern: Vec<u8> = (0..CHUNK).map(|i| (i % 251) as u8).collect();
    pool.write(&first, 0, &pattern).unwrap();

    let second = pool.allocate(512, 256).unwrap();
    pool.write(&second, 0, &[0xAB; 512]).unwrap();

    let stats = pool.stats();
    assert_eq!(stats.growth_count, 1);
    assert_eq!(stats.backing_store_size, 2 * CHUNK);
    assert_eq!(memory.transfer_stats().total_copies, 1);
    assert_eq!(memory.transfer_stats().total_bytes, CHUNK);

    let mut out = vec![0u8; CHUNK as usize];
    pool.read(&first, 0, &mut out).unwrap();
    assert_eq!(out, pattern);

    let mut out = [0u8; 512];
    pool.read(&second, 0, &mut out).unwrap();
    assert_eq!(out, [0xAB; 512]);
}

#[test]
fn test_out_of_memory_without_growth() {
    let (pool, memory) = host_pool(config(1, false));
    let _full = pool.allocate(CHUNK, 1).unwrap();

    match pool.allocate(1, 1) {
        Err(PoolError::OutOfMemory {
            size,
            backing_store_size,
            ..
        }) => {
            assert_eq!(size, 1);
            assert_eq!(backing_store_size, CHUNK);
        }
        other => panic!("expected OutOfMemory, got {other:?}"),
    }
    assert_eq!(memory.live_stores(), 1);

    // The failure is local to the request.
    assert!(pool.validate().is_ok());
}

#[test]
fn test_growth_stops_at_max_size() {
    let memory = Arc::new(HostMemory::new());
    let config = PoolConfig {
        max_size: Some(2 * CHUNK),
        ..config(1, true)
    };
    let pool = ChunkPool::new(config, memory.clone(), memory).unwrap();

    let _a = pool.allocate(CHUNK, 1).unwrap();
    let _b = pool.allocate(CHUNK, 1).unwrap();
    assert!(matches!(
        pool.allocate(CHUNK, 1),
        Err(PoolError::OutOfMemory { .. })
    ));
    assert_eq!(pool.stats().backing_store_size, 2 * CHUNK);
}

#[test]
fn test_device_out_of_memory_during_growth() {
    // Room for the initial store but not for it plus a doubled copy.
    let memory = Arc::new(HostMemory::with_budget(2 * CHUNK));
    let pool = ChunkPool::new(config(1, true), memory.clone(), memory.clone()).unwrap();

    let _a = pool.allocate(CHUNK, 1).unwrap();
    assert!(matches!(
        pool.allocate(16, 1),
        Err(PoolError::OutOfMemory { .. })
    ));
    assert_eq!(memory.live_stores(), 1);
    assert_eq!(pool.stats().growth_count, 0);
}

#[test]
fn test_failed_growth_copy_makes_pool_unusable() {
    let (pool, memory) = host_pool(config(1, true));
    let token = pool.allocate(CHUNK, 1).unwrap();
    memory.set_fail_copies(true);

    assert!(matches!(
        pool.allocate(16, 1),
        Err(PoolError::GrowthTransferFailed(_))
    ));
    // The replacement store was released.
    assert_eq!(memory.live_stores(), 1);
    assert_eq!(memory.transfer_stats().failed_copies, 1);

    assert!(matches!(pool.allocate(16, 1), Err(PoolError::Unusable)));
    assert!(matches!(
        pool.write(&token, 0, &[1, 2, 3]),
        Err(PoolError::Unusable)
    ));

    pool.deferred_free(token);
    pool.shutdown(Duration::from_millis(10)).unwrap();
    assert_eq!(memory.live_stores(), 0);
}

#[test]
fn test_replaced_store_waits_for_copy_fence() {
    let memory = Arc::new(HostMemory::new());
    let copier = Arc::new(SlowCopies {
        memory: memory.clone(),
        fences: Mutex::new(Vec::new()),
    });
    let pool = ChunkPool::new(config(1, true), memory.clone(), copier.clone()).unwrap();

    let a = pool.allocate(CHUNK, 1).unwrap();
    let old_store = pool.backing_store().unwrap();
    let b = pool.allocate(CHUNK, 1).unwrap();
    assert_ne!(pool.backing_store(), Some(old_store));

    let epoch = ManualFence::new();
    let report = pool.end_epoch(epoch.clone());
    assert_eq!(report.released_backing_stores, 0);
    assert!(memory.contains(old_store));
    assert_eq!(pool.stats().retired_backing_stores, 1);

    // Shutdown refuses while the copy is in flight.
    assert!(matches!(
        pool.shutdown(Duration::from_millis(10)),
        Err(PoolError::FenceTimeout { pending: 1 })
    ));

    // Copy finished, epoch still running.
    copier.complete_all();
    let report = pool.end_epoch(ManualFence::new());
    assert_eq!(report.released_backing_stores, 0);
    assert!(memory.contains(old_store));

    epoch.signal();
    let report = pool.end_epoch(ManualFence::new());
    assert_eq!(report.released_backing_stores, 1);
    assert!(!memory.contains(old_store));

    pool.deferred_free(a);
    pool.deferred_free(b);
    pool.shutdown(Duration::from_millis(10)).unwrap();
    assert_eq!(memory.live_stores(), 0);
}

#[test]
fn test_replaced_store_outlives_its_epoch() {
    let (pool, memory) = host_pool(config(1, true));
    let _full = pool.allocate(CHUNK, 1).unwrap();
    let old_store = pool.backing_store().unwrap();

    // Host copies complete at once; growth happens mid-epoch.
    let _more = pool.allocate(16, 1).unwrap();
    let epoch = ManualFence::new();
    pool.end_epoch(epoch.clone());
    pool.end_epoch(ManualFence::new());
    assert!(memory.contains(old_store));

    epoch.signal();
    let report = pool.end_epoch(ManualFence::new());
    assert_eq!(report.released_backing_stores, 1);
    assert!(!memory.contains(old_store));
}

#[test]
fn test_shutdown_timeout_is_shared() {
    let memory = Arc::new(HostMemory::new());
    let copier = Arc::new(SlowCopies {
        memory: memory.clone(),
        fences: Mutex::new(Vec::new()),
    });
    let pool = ChunkPool::new(config(1, true), memory.clone(), copier).unwrap();

    let a = pool.allocate(CHUNK, 1).unwrap();
    pool.deferred_free(a);
    pool.end_epoch(ManualFence::new());
    // Growth behind a copy that never completes.
    let _b = pool.allocate(CHUNK, 1).unwrap();
    let _c = pool.allocate(CHUNK, 1).unwrap();
    pool.end_epoch(ManualFence::new());

    let start = Instant::now();
    assert!(matches!(
        pool.shutdown(Duration::from_millis(200)),
        Err(PoolError::FenceTimeout { .. })
    ));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(350), "blocked for {elapsed:?}");
}

#[test]
fn test_shutdown_then_late_free() {
    let (pool, memory) = host_pool(config(1, true));
    let leaked = pool.allocate(128, 16).unwrap();

    pool.shutdown(Duration::from_millis(10)).unwrap();
    assert_eq!(memory.live_stores(), 0);

    pool.deferred_free(leaked);
    assert_eq!(pool.stats().pending_free_allocations, 0);
    assert!(matches!(pool.allocate(16, 1), Err(PoolError::Unusable)));

    // A second shutdown is a no-op.
    pool.shutdown(Duration::from_millis(10)).unwrap();
}

#[test]
fn test_concurrent_allocate_and_free() {
    let (pool, _memory) = host_pool(config(1, true));

    thread::scope(|s| {
        for worker in 0..4u8 {
            let pool = &pool;
            s.spawn(move || {
                for i in 0..200u64 {
                    let size = 64 + (i * 37 + worker as u64 * 101) % 4000;
                    let token = pool.allocate(size, 16).unwrap();
                    let tag = vec![worker; size as usize];
                    pool.write(&token, 0, &tag).unwrap();

                    let mut out = vec![0u8; size as usize];
                    pool.read(&token, 0, &mut out).unwrap();
                    assert_eq!(out, tag);

                    pool.deferred_free(token);
                    if i % 16 == 0 {
                        pool.end_epoch(ManualFence::signaled_now());
                    }
                }
            });
        }
    });

    pool.end_epoch(ManualFence::signaled_now());
    pool.end_epoch(ManualFence::signaled_now());
    pool.validate().unwrap();

    let stats = pool.stats();
    assert_eq!(stats.user_allocated_bytes, 0);
    assert_eq!(stats.pending_free_allocations, 0);
    assert_eq!(stats.live_chunks, 0);
    assert_eq!(stats.free_bytes, stats.backing_store_size);
}
