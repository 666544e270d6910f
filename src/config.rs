//! Runtime configuration for gpu-suballoc.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Pool sizing knobs live in [`PoolConfig`]; the workload driver's in [`SimConfig`].

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Largest chunk order accepted (1 TiB chunks).
pub const MAX_CHUNK_ORDER: u32 = 40;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "gpu-suballoc", about = "Drive a GPU memory pool with a simulated frame loop")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override the number of simulated frames.
    #[arg(long)]
    pub frames: Option<u64>,

    /// Override the number of worker tasks.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Print the final report as JSON.
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Memory pool configuration.
    pub pool: PoolConfig,

    /// Simulated workload.
    pub sim: SimConfig,
}

/// Chunk pool sizing and growth policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Size of the backing store when it is first created, in bytes.
    pub initial_size: u64,

    /// log2 of the chunk size; every chunk's arena has this max order.
    pub chunk_order: u32,

    /// Permit copy-on-write growth of the backing store.
    pub allow_growth: bool,

    /// Upper bound for the backing store size (None = unbounded).
    pub max_size: Option<u64>,

    /// How long shutdown waits on each outstanding fence, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 64 * 1024 * 1024, // 64 MiB
            chunk_order: 24,                // 16 MiB chunks
            allow_growth: true,
            max_size: None,
            shutdown_timeout_ms: 1000,
        }
    }
}

impl PoolConfig {
    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> u64 {
        1u64 << self.chunk_order
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Check the sizing rules. Returns a description of the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_order == 0 || self.chunk_order > MAX_CHUNK_ORDER {
            return Err(format!(
                "chunk_order {} outside 1..={MAX_CHUNK_ORDER}",
                self.chunk_order
            ));
        }
        let chunk_size = self.chunk_size();
        if self.initial_size == 0 || self.initial_size % chunk_size != 0 {
            return Err(format!(
                "initial_size {} is not a non-zero multiple of the chunk size {chunk_size}",
                self.initial_size
            ));
        }
        if let Some(max) = self.max_size {
            if max < self.initial_size {
                return Err(format!(
                    "max_size {max} is smaller than initial_size {}",
                    self.initial_size
                ));
            }
        }
        Ok(())
    }
}

/// Simulated renderer workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of frames to run.
    pub frames: u64,

    /// Concurrent worker tasks allocating each frame.
    pub workers: usize,

    /// Allocations per worker per frame.
    pub allocations_per_frame: usize,

    /// Smallest allocation in bytes.
    pub min_allocation: u64,

    /// Largest allocation in bytes.
    pub max_allocation: u64,

    /// Alignments to pick from (powers of two).
    pub alignments: Vec<u64>,

    /// Frames an allocation stays alive before it is freed.
    pub lifetime_frames: u64,

    /// Frames between submitting an epoch and its fence signaling.
    pub gpu_latency_frames: u64,

    /// Frame pacing in milliseconds (0 = run as fast as possible).
    pub frame_interval_ms: u64,

    /// Seed of the per-worker pseudo-random streams.
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            frames: 600,
            workers: 4,
            allocations_per_frame: 16,
            min_allocation: 256,
            max_allocation: 256 * 1024,
            alignments: vec![16, 256, 4096],
            lifetime_frames: 8,
            gpu_latency_frames: 2,
            frame_interval_ms: 0,
            seed: 0x5eed,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config
                .pool
                .validate()
                .map_err(|e| anyhow::anyhow!("invalid pool config: {e}"))?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
