//! gpu-suballoc: sub-allocation of GPU device memory.
//!
//! A [`ChunkPool`] hands out ranges of one growable backing store. The store
//! is cut into fixed-size chunks, each managed by a [`BuddyArena`]. Freed
//! ranges are only reused once the GPU work of the epoch that freed them has
//! completed, and growth copies the store into a buffer twice its size while
//! keeping the old one alive until the copy has executed.
//!
//! Device access is abstracted by the traits in [`gpu`]; [`gpu::HostMemory`]
//! backs everything with host RAM.

pub mod arena;
pub mod config;
pub mod gpu;
pub mod pool;
pub mod sim;

pub use arena::{ArenaError, ArenaStats, BuddyArena};
pub use config::{Config, PoolConfig, SimConfig};
pub use pool::{new_shared_pool, AllocationToken, ChunkPool, EpochReport, PoolError, PoolStats, SharedPool};
