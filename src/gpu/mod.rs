//! Collaborator contracts the pool consumes, and a host-memory backend.
//!
//! - [`backing`]: backing-store provider (create / destroy / CPU access)
//! - [`transfer`]: device-side copy used by copy-on-write growth
//! - [`fence`]: completion fences
//! - [`host`]: host-RAM implementation of the provider and copy engine

pub mod backing;
pub mod fence;
pub mod host;
pub mod transfer;

pub use backing::{BackingHandle, BackingStoreError, BackingStoreProvider};
pub use fence::{Fence, FenceSet, ManualFence, SharedFence};
pub use host::HostMemory;
pub use transfer::{CopyEngine, TransferError, TransferStats};
