//! Fence-guarded release queue.
//!
//! Items wait here until the fence they were queued with signals. Each entry
//! is checked on its own, so a later fence signaling first releases its items
//! first. Shared by the garbage collector (freed allocations) and the growth
//! path (replaced backing stores).

use std::fmt;
use std::time::{Duration, Instant};

use crate::gpu::fence::SharedFence;

pub struct FencedQueue<T> {
    entries: Vec<(SharedFence, T)>,
}

impl<T> Default for FencedQueue<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> FencedQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fence: SharedFence, item: T) {
        self.entries.push((fence, item));
    }

    /// Remove and return every item whose fence has signaled. Never blocks.
    pub fn drain_signaled(&mut self) -> Vec<T> {
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|(fence, _)| fence.signaled());
        self.entries = pending;
        ready.into_iter().map(|(_, item)| item).collect()
    }

    /// Wait until every fence signals or `timeout` elapses.
    ///
    /// Returns the number of fences still unsignaled.
    pub fn wait_all(&self, timeout: Duration) -> usize {
        self.wait_until(Instant::now() + timeout)
    }

    /// Like [`wait_all`](Self::wait_all) against an absolute deadline, so
    /// several queues can share one.
    pub fn wait_until(&self, deadline: Instant) -> usize {
        self.entries
            .iter()
            .filter(|(fence, _)| {
                let remaining = deadline.saturating_duration_since(Instant::now());
                !fence.client_wait(remaining)
            })
            .count()
    }

    /// Remove every item regardless of its fence.
    pub fn drain_all(&mut self) -> Vec<T> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(_, item)| item)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: fmt::Debug> fmt::Debug for FencedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .map(|(fence, item)| (fence.signaled(), item)),
            )
            .finish()
    }
}
