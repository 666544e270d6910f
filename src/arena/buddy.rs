//! Buddy arena: free/used state of one power-of-two address range.
//!
//! Blocks only exist at power-of-two sizes. A block of order `o` is `2^o`
//! bytes and always starts at a multiple of `2^o`, so its buddy is found by
//! toggling bit `o` of its address. Free lists are plain ordered sets of
//! addresses, one per order.
//!
//! An empty arena stores nothing: the capacity-sized block is materialized on
//! the first allocation and never stored back when a free coalesces all the
//! way up. Resetting an empty arena is therefore free.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest supported arena order (256 TiB).
pub const MAX_ARENA_ORDER: u32 = 48;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    #[error("Arena out of space: cannot fit {size} bytes aligned to {alignment}")]
    OutOfSpace { size: u64, alignment: u64 },

    #[error("Invalid arena request: {0}")]
    InvalidRequest(String),

    #[error("Arena bookkeeping corrupted: {0}")]
    Corrupted(String),
}

/// Point-in-time arena usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ArenaStats {
    /// Total address range in bytes.
    pub capacity: u64,

    /// Bytes requested by callers.
    pub user_allocated_bytes: u64,

    /// Bytes consumed by granted blocks (power-of-two rounding and padding included).
    pub real_allocated_bytes: u64,

    /// `capacity - real_allocated_bytes`.
    pub free_bytes: u64,

    /// Size of the largest free block.
    pub largest_free_block: u64,

    /// `1 - largest_free_block / free_bytes`. Zero means all free memory is one block.
    pub external_fragmentation: f64,

    /// `1 - user_allocated_bytes / real_allocated_bytes`.
    pub internal_fragmentation: f64,
}

/// Power-of-two buddy allocator over `[0, 2^max_order)`.
///
/// Performs no locking; the owner serializes access.
#[derive(Debug, Clone)]
pub struct BuddyArena {
    max_order: u32,

    /// Free block addresses indexed by order.
    free_lists: Vec<BTreeSet<u64>>,

    user_allocated_bytes: u64,

    real_allocated_bytes: u64,
}

/// Smallest `o` such that `2^o >= value`.
fn ceil_log2(value: u64) -> u32 {
    debug_assert!(value > 0);
    if value <= 1 {
        0
    } else {
        u64::BITS - (value - 1).leading_zeros()
    }
}

impl BuddyArena {
    /// Create an arena of capacity `2^max_order` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `max_order` exceeds [`MAX_ARENA_ORDER`].
    pub fn new(max_order: u32) -> Self {
        assert!(
            max_order <= MAX_ARENA_ORDER,
            "arena order {max_order} exceeds {MAX_ARENA_ORDER}"
        );

        Self {
            max_order,
            free_lists: vec![BTreeSet::new(); max_order as usize + 1],
            user_allocated_bytes: 0,
            real_allocated_bytes: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        1u64 << self.max_order
    }

    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    /// True when no block is allocated.
    pub fn is_empty(&self) -> bool {
        self.real_allocated_bytes == 0
    }

    pub fn user_allocated_bytes(&self) -> u64 {
        self.user_allocated_bytes
    }

    pub fn real_allocated_bytes(&self) -> u64 {
        self.real_allocated_bytes
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity() - self.real_allocated_bytes
    }

    /// Order of the block that serves `(size, alignment)` and whether
    /// alignment padding is folded into it. `None` for a zero size or
    /// alignment, or a request beyond the address space.
    ///
    /// A block of order `o` is naturally aligned to `2^o`. Larger (or
    /// non power-of-two) alignments are served from a block big enough for
    /// `size + alignment`, so the rounded-up address still fits.
    pub fn block_order(size: u64, alignment: u64) -> Option<(u32, bool)> {
        if size == 0 || alignment == 0 {
            return None;
        }

        let order = ceil_log2(size);
        if order >= u64::BITS {
            return None;
        }
        if alignment.is_power_of_two() && alignment <= 1u64 << order {
            return Some((order, false));
        }

        let order = ceil_log2(size.checked_add(alignment)?);
        (order < u64::BITS).then_some((order, true))
    }

    fn order_for(&self, size: u64, alignment: u64) -> Result<(u32, bool), ArenaError> {
        if size == 0 || size > self.capacity() {
            return Err(ArenaError::InvalidRequest(format!(
                "size {size} outside (0, {}]",
                self.capacity()
            )));
        }
        if alignment == 0 {
            return Err(ArenaError::InvalidRequest("alignment must be non-zero".to_string()));
        }

        match Self::block_order(size, alignment) {
            Some((order, padded)) if order <= self.max_order => Ok((order, padded)),
            _ => Err(ArenaError::OutOfSpace { size, alignment }),
        }
    }

    /// Allocate `size` bytes aligned to `alignment`. Returns the address.
    ///
    /// Never retries: `OutOfSpace` is for the owner to handle.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<u64, ArenaError> {
        let (order, _) = self.order_for(size, alignment)?;

        let mut found = None;
        for o in order..=self.max_order {
            if let Some(address) = self.free_lists[o as usize].pop_first() {
                found = Some((address, o));
                break;
            }
        }

        let (block, found_order) = match found {
            Some(hit) => hit,
            None if self.is_empty() => (0, self.max_order),
            None => return Err(ArenaError::OutOfSpace { size, alignment }),
        };

        // Split down, keeping the left half and freeing each right half.
        for o in (order..found_order).rev() {
            self.free_lists[o as usize].insert(block + (1u64 << o));
        }

        let block_size = 1u64 << order;
        let address = block.next_multiple_of(alignment);
        debug_assert!(address + size <= block + block_size);

        self.user_allocated_bytes += size;
        self.real_allocated_bytes += block_size;

        Ok(address)
    }

    /// Return a range obtained from [`allocate`](Self::allocate).
    ///
    /// `size` and `alignment` must be the values passed to `allocate`.
    pub fn free(&mut self, address: u64, size: u64, alignment: u64) {
        let (order, padded) = match self.order_for(size, alignment) {
            Ok(v) => v,
            Err(e) => {
                debug_assert!(false, "free with a request allocate would reject: {e}");
                return;
            }
        };

        let block_size = 1u64 << order;
        let mut block = if padded {
            address & !(block_size - 1)
        } else {
            address
        };

        debug_assert!(block % block_size == 0, "address {address} is not a block of order {order}");
        debug_assert!(address + size <= block + block_size);
        debug_assert!(
            self.real_allocated_bytes >= block_size && self.user_allocated_bytes >= size,
            "free of {size} bytes exceeds allocated bytes"
        );

        self.user_allocated_bytes -= size;
        self.real_allocated_bytes -= block_size;

        let mut o = order;
        while o < self.max_order {
            let buddy = block ^ (1u64 << o);
            if self.free_lists[o as usize].remove(&buddy) {
                block = block.min(buddy);
                o += 1;
                continue;
            }

            let inserted = self.free_lists[o as usize].insert(block);
            debug_assert!(inserted, "double free of block {block} (order {o})");
            break;
        }

        debug_assert!(
            self.user_allocated_bytes != 0 || self.free_lists.iter().all(BTreeSet::is_empty),
            "arena empty but free lists are not"
        );
    }

    /// Drop all state of an empty arena.
    pub fn reset(&mut self) {
        debug_assert!(self.user_allocated_bytes == 0, "reset of an arena with live allocations");
        for list in &mut self.free_lists {
            list.clear();
        }
        self.user_allocated_bytes = 0;
        self.real_allocated_bytes = 0;
    }

    /// Size of the largest free block.
    pub fn largest_free_block(&self) -> u64 {
        if self.is_empty() {
            return self.capacity();
        }
        self.free_lists
            .iter()
            .rposition(|list| !list.is_empty())
            .map(|o| 1u64 << o)
            .unwrap_or(0)
    }

    /// Every free block as `(address, size)`, by increasing order.
    pub fn free_blocks(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        let whole = self.is_empty().then_some((0, self.capacity()));
        whole.into_iter().chain(
            self.free_lists
                .iter()
                .enumerate()
                .flat_map(|(o, list)| list.iter().map(move |&a| (a, 1u64 << o))),
        )
    }

    pub fn stats(&self) -> ArenaStats {
        let free_bytes = self.free_bytes();
        let largest_free_block = self.largest_free_block();

        let external_fragmentation = if free_bytes == 0 {
            0.0
        } else {
            1.0 - largest_free_block as f64 / free_bytes as f64
        };
        let internal_fragmentation = if self.real_allocated_bytes == 0 {
            0.0
        } else {
            1.0 - self.user_allocated_bytes as f64 / self.real_allocated_bytes as f64
        };

        ArenaStats {
            capacity: self.capacity(),
            user_allocated_bytes: self.user_allocated_bytes,
            real_allocated_bytes: self.real_allocated_bytes,
            free_bytes,
            largest_free_block,
            external_fragmentation,
            internal_fragmentation,
        }
    }

    /// Quadratic fragmentation metric: `1 - (sqrt(Σ block²) / free)²`.
    ///
    /// Penalizes many small holes more than [`ArenaStats::external_fragmentation`].
    pub fn external_fragmentation_sawicki(&self) -> f64 {
        let free = self.free_bytes();
        if free == 0 {
            return 0.0;
        }
        let sum_sq: f64 = self
            .free_blocks()
            .map(|(_, size)| {
                let s = size as f64;
                s * s
            })
            .sum();
        let quality = sum_sq.sqrt() / free as f64;
        1.0 - quality * quality
    }

    /// Check the free lists against the counters. Expensive.
    pub fn validate(&self) -> Result<(), ArenaError> {
        let capacity = self.capacity();

        if self.user_allocated_bytes > self.real_allocated_bytes {
            return Err(ArenaError::Corrupted(format!(
                "user bytes {} exceed real bytes {}",
                self.user_allocated_bytes, self.real_allocated_bytes
            )));
        }
        if self.real_allocated_bytes > capacity {
            return Err(ArenaError::Corrupted(format!(
                "real bytes {} exceed capacity {capacity}",
                self.real_allocated_bytes
            )));
        }
        if self.is_empty() {
            if self.user_allocated_bytes != 0 {
                return Err(ArenaError::Corrupted("user bytes in an empty arena".to_string()));
            }
            if self.free_lists.iter().any(|l| !l.is_empty()) {
                return Err(ArenaError::Corrupted("empty arena holds free blocks".to_string()));
            }
            return Ok(());
        }

        let mut blocks = Vec::new();
        for (o, list) in self.free_lists.iter().enumerate() {
            let size = 1u64 << o;
            for &address in list {
                if address % size != 0 {
                    return Err(ArenaError::Corrupted(format!(
                        "free block {address} misaligned for order {o}"
                    )));
                }
                if address + size > capacity {
                    return Err(ArenaError::Corrupted(format!(
                        "free block {address} (order {o}) past capacity {capacity}"
                    )));
                }
                if o < self.max_order as usize && list.contains(&(address ^ size)) {
                    return Err(ArenaError::Corrupted(format!(
                        "free block {address} and its buddy were not merged (order {o})"
                    )));
                }
                blocks.push((address, size));
            }
        }

        blocks.sort_unstable();
        for pair in blocks.windows(2) {
            let (a, a_size) = pair[0];
            let (b, _) = pair[1];
            if a + a_size > b {
                return Err(ArenaError::Corrupted(format!("free blocks {a} and {b} overlap")));
            }
        }

        let free_sum: u64 = blocks.iter().map(|&(_, s)| s).sum();
        if free_sum + self.real_allocated_bytes != capacity {
            return Err(ArenaError::Corrupted(format!(
                "free {free_sum} + allocated {} != capacity {capacity}",
                self.real_allocated_bytes
            )));
        }

        Ok(())
    }
}

impl fmt::Display for BuddyArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Arena capacity {}, allocated {} ({} requested)",
            self.capacity(),
            self.real_allocated_bytes,
            self.user_allocated_bytes
        )?;
        if self.is_empty() {
            return writeln!(f, "  empty");
        }
        for (o, list) in self.free_lists.iter().enumerate() {
            if list.is_empty() {
                continue;
            }
            let size = 1u64 << o;
            write!(f, "  Order {o} ({size} B)\n    ")?;
            for &address in list {
                write!(f, "| {}-{} ", address, address + size - 1)?;
            }
            writeln!(f, "|")?;
        }
        Ok(())
    }
}
