//! Address-range bookkeeping.
//!
//! - [`buddy`]: power-of-two buddy arena (split on allocate, coalesce on free)

pub mod buddy;

pub use buddy::{ArenaError, ArenaStats, BuddyArena, MAX_ARENA_ORDER};
