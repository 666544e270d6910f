//! Epoch-bucketed deferred reclamation.
//!
//! Freed tokens collect in the active bucket. When the epoch ends the bucket
//! is sealed with the epoch's fence, and its tokens become reclaimable only
//! once that fence has signaled. A token moves free → pending → reclaimed,
//! never back.

use std::time::Instant;

use tracing::debug;

use crate::gpu::fence::SharedFence;
use crate::pool::chunk::AllocationToken;
use crate::pool::deferred::FencedQueue;

/// Outcome of one epoch boundary.
#[derive(Debug, Default)]
pub struct EpochDrain {
    /// Tokens whose fence signaled; the caller returns them to their arenas.
    pub reclaimable: Vec<AllocationToken>,

    /// Whether the active bucket was sealed.
    pub sealed: bool,
}

#[derive(Debug, Default)]
pub struct GarbageCollector {
    /// Bucket accepting frees for the current epoch.
    active: Vec<AllocationToken>,

    /// Buckets waiting on their epoch's fence.
    sealed: FencedQueue<Vec<AllocationToken>>,

    pending_bytes: u64,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a token for reclamation after the current epoch's fence.
    pub fn defer(&mut self, token: AllocationToken) {
        self.pending_bytes += token.size();
        self.active.push(token);
    }

    /// Collect signaled buckets, then seal the active bucket with `fence`.
    ///
    /// An empty active bucket stays active and `fence` is dropped.
    pub fn end_epoch(&mut self, fence: SharedFence) -> EpochDrain {
        let reclaimable: Vec<AllocationToken> =
            self.sealed.drain_signaled().into_iter().flatten().collect();
        let reclaimed_bytes: u64 = reclaimable.iter().map(AllocationToken::size).sum();
        self.pending_bytes -= reclaimed_bytes;

        let sealed = !self.active.is_empty();
        if sealed {
            let bucket = std::mem::take(&mut self.active);
            debug!(tokens = bucket.len(), "Sealed garbage bucket");
            self.sealed.push(fence, bucket);
        }

        if !reclaimable.is_empty() {
            debug!(
                tokens = reclaimable.len(),
                bytes = reclaimed_bytes,
                "Garbage reclaimable"
            );
        }

        EpochDrain {
            reclaimable,
            sealed,
        }
    }

    /// Wait on every sealed bucket until `deadline`. Returns the number
    /// still unsignaled.
    pub fn wait_until(&self, deadline: Instant) -> usize {
        self.sealed.wait_until(deadline)
    }

    /// Take every pending token, sealed or not.
    pub fn drain_all(&mut self) -> Vec<AllocationToken> {
        let mut tokens: Vec<AllocationToken> =
            self.sealed.drain_all().into_iter().flatten().collect();
        tokens.append(&mut self.active);
        self.pending_bytes = 0;
        tokens
    }

    /// Tokens not yet reclaimed (active and sealed).
    pub fn pending_allocations(&self) -> usize {
        self.active.len() + self.sealed.iter().map(Vec::len).sum::<usize>()
    }

    /// User bytes of pending tokens.
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    /// Buckets sealed and awaiting their fence.
    pub fn sealed_buckets(&self) -> usize {
        self.sealed.len()
    }

    pub fn iter_pending(&self) -> impl Iterator<Item = &AllocationToken> {
        self.active.iter().chain(self.sealed.iter().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::fence::ManualFence;
    use crate::pool::chunk::{Chunk, ChunkId};

    fn tokens(count: usize) -> (Chunk, Vec<AllocationToken>) {
        let mut chunk = Chunk::new(ChunkId(0), 0, 16);
        let tokens = (0..count).map(|_| chunk.allocate(256, 16).unwrap()).collect();
        (chunk, tokens)
    }

    #[test]
    fn test_empty_bucket_not_sealed() {
        let mut gc = GarbageCollector::new();
        let drain = gc.end_epoch(ManualFence::new());
        assert!(!drain.sealed);
        assert_eq!(gc.sealed_buckets(), 0);
    }

    #[test]
    fn test_reclaim_waits_for_fence() {
        let (_chunk, mut toks) = tokens(2);
        let mut gc = GarbageCollector::new();
        gc.defer(toks.remove(0));
        gc.defer(toks.remove(0));
        assert_eq!(gc.pending_bytes(), 512);

        let fence = ManualFence::new();
        let drain = gc.end_epoch(fence.clone());
        assert!(drain.sealed);
        assert!(drain.reclaimable.is_empty());

        // Same epoch's fence still pending.
        let drain = gc.end_epoch(ManualFence::new());
        assert!(drain.reclaimable.is_empty());
        assert_eq!(gc.pending_allocations(), 2);

        fence.signal();
        let drain = gc.end_epoch(ManualFence::new());
        assert_eq!(drain.reclaimable.len(), 2);
        assert_eq!(gc.pending_bytes(), 0);
        assert_eq!(gc.pending_allocations(), 0);
    }

    #[test]
    fn test_out_of_order_buckets() {
        let (_chunk, mut toks) = tokens(2);
        let mut gc = GarbageCollector::new();

        let epoch1 = ManualFence::new();
        gc.defer(toks.remove(0));
        gc.end_epoch(epoch1.clone());

        let epoch2 = ManualFence::new();
        gc.defer(toks.remove(0));
        gc.end_epoch(epoch2.clone());

        epoch2.signal();
        let drain = gc.end_epoch(ManualFence::new());
        assert_eq!(drain.reclaimable.len(), 1);
        assert_eq!(drain.reclaimable[0].offset_in_chunk(), 256);
        assert_eq!(gc.sealed_buckets(), 1);
    }

    #[test]
    fn test_drain_all() {
        let (_chunk, mut toks) = tokens(3);
        let mut gc = GarbageCollector::new();
        gc.defer(toks.remove(0));
        gc.end_epoch(ManualFence::new());
        gc.defer(toks.remove(0));

        assert_eq!(gc.iter_pending().count(), 2);
        assert_eq!(gc.drain_all().len(), 2);
        assert_eq!(gc.pending_bytes(), 0);
    }
}
