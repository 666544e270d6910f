//! Frame-loop workload driver.
//!
//! Models a renderer: every frame a set of workers allocate transient
//! buffers, stamp them with a tag, and free buffers that have lived for
//! `lifetime_frames`. Each frame closes an epoch with a fence that a fake GPU
//! queue signals a few frames later, not necessarily in submission order.
//! A tag that changed before its buffer was freed means the pool handed the
//! same memory out twice.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SimConfig;
use crate::gpu::fence::ManualFence;
use crate::pool::{AllocationToken, ChunkPool, PoolError, PoolStats, SharedPool};

/// Bytes of tag pattern written at the start of every allocation.
const TAG_BYTES: usize = 64;

#[derive(Error, Debug)]
pub enum SimError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub frames: u64,
    pub allocations: u64,
    pub frees: u64,
    /// Allocations refused with `OutOfMemory`.
    pub failed_allocations: u64,
    /// Tags found overwritten at free time.
    pub corrupted: u64,
    pub peak_backing_store_size: u64,
    /// Pool state after the last reclamation, before shutdown.
    pub final_stats: PoolStats,
}

#[derive(Debug, Default, Clone, Copy)]
struct FrameCounts {
    allocations: u64,
    frees: u64,
    failed: u64,
    corrupted: u64,
}

impl FrameCounts {
    fn add(&mut self, other: FrameCounts) {
        self.allocations += other.allocations;
        self.frees += other.frees;
        self.failed += other.failed;
        self.corrupted += other.corrupted;
    }
}

#[derive(Debug)]
struct LiveBuffer {
    frame: u64,
    token: AllocationToken,
    tag: u64,
}

/// Per-worker state, moved into a blocking task each frame and back.
#[derive(Debug)]
struct Worker {
    id: u64,
    rng: StdRng,
    live: VecDeque<LiveBuffer>,
    sequence: u64,
}

impl Worker {
    fn new(id: u64, seed: u64) -> Self {
        Self {
            id,
            rng: StdRng::seed_from_u64(seed.wrapping_add(id)),
            live: VecDeque::new(),
            sequence: 0,
        }
    }

    fn next_tag(&mut self) -> u64 {
        self.sequence += 1;
        (self.id << 48) | self.sequence
    }

    fn run_frame(
        &mut self,
        pool: &ChunkPool,
        frame: u64,
        config: &SimConfig,
    ) -> Result<FrameCounts, PoolError> {
        let mut counts = FrameCounts::default();

        while self
            .live
            .front()
            .is_some_and(|b| frame.saturating_sub(b.frame) >= config.lifetime_frames)
        {
            let Some(buffer) = self.live.pop_front() else {
                break;
            };
            counts.corrupted += u64::from(release(pool, buffer)?);
            counts.frees += 1;
        }

        for _ in 0..config.allocations_per_frame {
            let min = config.min_allocation.max(1);
            let size = self.rng.gen_range(min..=config.max_allocation.max(min));
            let alignment = config.alignments.choose(&mut self.rng).copied().unwrap_or(1);

            match pool.allocate(size, alignment) {
                Ok(token) => {
                    let tag = self.next_tag();
                    pool.write(&token, 0, &tag_pattern(tag, size))?;
                    self.live.push_back(LiveBuffer { frame, token, tag });
                    counts.allocations += 1;
                }
                Err(PoolError::OutOfMemory { .. }) => counts.failed += 1,
                Err(e) => return Err(e),
            }
        }

        Ok(counts)
    }

    /// Free everything still alive.
    fn drain(&mut self, pool: &ChunkPool) -> Result<FrameCounts, PoolError> {
        let mut counts = FrameCounts::default();
        while let Some(buffer) = self.live.pop_front() {
            counts.corrupted += u64::from(release(pool, buffer)?);
            counts.frees += 1;
        }
        Ok(counts)
    }
}

fn tag_pattern(tag: u64, size: u64) -> Vec<u8> {
    let words = [tag; TAG_BYTES / 8];
    let len = TAG_BYTES.min(size as usize);
    bytemuck::cast_slice::<u64, u8>(&words)[..len].to_vec()
}

/// Check the buffer's tag and hand it to the pool. Returns whether the tag
/// was corrupted.
fn release(pool: &ChunkPool, buffer: LiveBuffer) -> Result<bool, PoolError> {
    let expected = tag_pattern(buffer.tag, buffer.token.size());
    let mut actual = vec![0u8; expected.len()];
    pool.read(&buffer.token, 0, &mut actual)?;

    let corrupted = actual != expected;
    if corrupted {
        warn!(
            offset = buffer.token.global_offset(),
            size = buffer.token.size(),
            "Allocation tag overwritten while live"
        );
    }
    pool.deferred_free(buffer.token);
    Ok(corrupted)
}

/// Simulated GPU queue: fences signal once their due frame is reached.
#[derive(Debug, Default)]
struct GpuQueue {
    in_flight: Vec<(u64, Arc<ManualFence>)>,
}

impl GpuQueue {
    fn submit(&mut self, due_frame: u64, fence: Arc<ManualFence>) {
        self.in_flight.push((due_frame, fence));
    }

    /// Signal every fence due by `frame`, in random order.
    fn retire_due(&mut self, frame: u64, rng: &mut StdRng) -> usize {
        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|(due, _)| *due <= frame);
        self.in_flight = pending;

        due.shuffle(rng);
        for (_, fence) in &due {
            fence.signal();
        }
        due.len()
    }

    fn signal_all(&mut self) {
        for (_, fence) in self.in_flight.drain(..) {
            fence.signal();
        }
    }
}

pub struct Simulator {
    pool: SharedPool,
    config: Arc<SimConfig>,
}

impl Simulator {
    pub fn new(pool: SharedPool, config: SimConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }

    /// Run every frame, then free everything and shut the pool down.
    pub async fn run(&self) -> Result<SimReport, SimError> {
        let config = &self.config;
        let mut workers: Vec<Worker> = (0..config.workers as u64)
            .map(|id| Worker::new(id, config.seed))
            .collect();
        let mut queue = GpuQueue::default();
        let mut queue_rng = StdRng::seed_from_u64(config.seed.rotate_left(17));

        let mut interval = (config.frame_interval_ms > 0)
            .then(|| tokio::time::interval(Duration::from_millis(config.frame_interval_ms)));

        let mut totals = FrameCounts::default();
        let mut peak = 0u64;

        info!(
            frames = config.frames,
            workers = config.workers,
            allocations_per_frame = config.allocations_per_frame,
            "Starting simulation"
        );

        for frame in 0..config.frames {
            if let Some(interval) = interval.as_mut() {
                interval.tick().await;
            }

            queue.retire_due(frame, &mut queue_rng);

            let mut handles = Vec::with_capacity(workers.len());
            for mut worker in workers.drain(..) {
                let pool = self.pool.clone();
                let config = self.config.clone();
                handles.push(tokio::task::spawn_blocking(move || {
                    let result = worker.run_frame(&pool, frame, &config);
                    (worker, result)
                }));
            }
            for handle in handles {
                let (worker, result) = handle.await?;
                workers.push(worker);
                totals.add(result?);
            }

            // Jittered latency lets a later epoch complete before an earlier one.
            let latency = config.gpu_latency_frames
                + queue_rng.gen_range(0..=config.gpu_latency_frames);
            let fence = ManualFence::new();
            queue.submit(frame + latency, fence.clone());
            let report = self.pool.end_epoch(fence);

            let stats = self.pool.stats();
            peak = peak.max(stats.backing_store_size);
            debug!(
                frame,
                reclaimed = report.reclaimed_allocations,
                pending = stats.pending_free_allocations,
                "Frame complete"
            );
            if frame > 0 && frame % 100 == 0 {
                info!(
                    frame,
                    backing_store_size = stats.backing_store_size,
                    utilization = format!("{:.1}%", stats.utilization() * 100.0),
                    growths = stats.growth_count,
                    "Simulation progress"
                );
            }
        }

        for worker in &mut workers {
            totals.add(worker.drain(&self.pool)?);
        }
        self.pool.end_epoch(ManualFence::signaled_now());
        queue.signal_all();
        // Every sealed bucket is signaled now.
        self.pool.end_epoch(ManualFence::signaled_now());

        self.pool.validate()?;
        let final_stats = self.pool.stats();
        peak = peak.max(final_stats.backing_store_size);

        let pool = self.pool.clone();
        let timeout = pool.config().shutdown_timeout();
        tokio::task::spawn_blocking(move || pool.shutdown(timeout)).await??;

        let report = SimReport {
            frames: config.frames,
            allocations: totals.allocations,
            frees: totals.frees,
            failed_allocations: totals.failed,
            corrupted: totals.corrupted,
            peak_backing_store_size: peak,
            final_stats,
        };
        info!(
            allocations = report.allocations,
            frees = report.frees,
            corrupted = report.corrupted,
            peak = report.peak_backing_store_size,
            "Simulation finished"
        );
        Ok(report)
    }
}
