//! Completion fences.
//!
//! A fence marks the completion of asynchronous (GPU) work. The pool only
//! ever polls or waits on them; it never signals one.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Completion signal supplied by the submission layer.
pub trait Fence: Send + Sync {
    /// Non-blocking poll.
    fn signaled(&self) -> bool;

    /// Block up to `timeout` for the fence. Returns whether it signaled.
    fn client_wait(&self, timeout: Duration) -> bool;
}

/// Shared fence reference. One submission may guard many resources.
pub type SharedFence = Arc<dyn Fence>;

/// Fence signaled explicitly by its owner.
///
/// Used by the host backend, the simulator's fake GPU queue and tests.
#[derive(Default)]
pub struct ManualFence {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl ManualFence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A fence for work that is already complete.
    pub fn signaled_now() -> Arc<Self> {
        let fence = Self::new();
        fence.signal();
        fence
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }
}

impl Fence for ManualFence {
    fn signaled(&self) -> bool {
        *self.signaled.lock()
    }

    fn client_wait(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            let _ = self
                .cond
                .wait_while_for(&mut signaled, |s| !*s, timeout);
        }
        *signaled
    }
}

impl fmt::Debug for ManualFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualFence")
            .field("signaled", &self.signaled())
            .finish()
    }
}

/// Signals once every member fence has signaled.
pub struct FenceSet {
    fences: Vec<SharedFence>,
}

impl FenceSet {
    pub fn new(fences: Vec<SharedFence>) -> Arc<Self> {
        Arc::new(Self { fences })
    }
}

impl Fence for FenceSet {
    fn signaled(&self) -> bool {
        self.fences.iter().all(|f| f.signaled())
    }

    fn client_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.fences.iter().all(|f| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            f.client_wait(remaining)
        })
    }
}

impl fmt::Debug for FenceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceSet")
            .field("fences", &self.fences.len())
            .field("signaled", &self.signaled())
            .finish()
    }
}
