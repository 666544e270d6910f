//! Benchmarks for the arena and the chunk pool.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use gpu_suballoc::arena::BuddyArena;
use gpu_suballoc::config::PoolConfig;
use gpu_suballoc::gpu::{HostMemory, ManualFence};
use gpu_suballoc::pool::ChunkPool;

fn bench_arena_churn(c: &mut Criterion) {
    // Mixed sizes, like per-frame uniform and vertex buffers.
    let sizes: Vec<u64> = (0..1024u64).map(|i| 64 + (i * 977) % 16_384).collect();

    c.bench_function("arena_alloc_free_1024_mixed", |b| {
        let mut arena = BuddyArena::new(26);
        let mut addrs = Vec::with_capacity(sizes.len());
        b.iter(|| {
            for &size in &sizes {
                addrs.push(arena.allocate(black_box(size), 256).unwrap());
            }
            for (&addr, &size) in addrs.iter().zip(&sizes) {
                arena.free(addr, size, 256);
            }
            addrs.clear();
        })
    });
}

fn bench_pool_frame(c: &mut Criterion) {
    let memory = Arc::new(HostMemory::new());
    let config = PoolConfig {
        initial_size: 64 << 20,
        chunk_order: 22,
        ..Default::default()
    };
    let pool = ChunkPool::new(config, memory.clone(), memory).unwrap();

    c.bench_function("pool_frame_256_allocs", |b| {
        b.iter(|| {
            for i in 0..256u64 {
                let token = pool.allocate(black_box(256 + i * 64), 16).unwrap();
                pool.deferred_free(token);
            }
            black_box(pool.end_epoch(ManualFence::signaled_now()));
        })
    });
}

fn bench_pool_growth(c: &mut Criterion) {
    c.bench_function("pool_grow_1mib_to_16mib", |b| {
        b.iter(|| {
            let memory = Arc::new(HostMemory::new());
            let config = PoolConfig {
                initial_size: 1 << 20,
                chunk_order: 20,
                ..Default::default()
            };
            let pool = ChunkPool::new(config, memory.clone(), memory).unwrap();
            let tokens: Vec<_> = (0..16).map(|_| pool.allocate(1 << 20, 1).unwrap()).collect();
            for token in tokens {
                pool.deferred_free(token);
            }
            black_box(pool.stats().growth_count);
        })
    });
}

criterion_group!(benches, bench_arena_churn, bench_pool_frame, bench_pool_growth);
criterion_main!(benches);
