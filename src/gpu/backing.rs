//! Backing-store provider contract.
//!
//! A backing store is one block of device memory (e.g. a GPU-visible buffer)
//! identified by an opaque handle. The pool never looks inside a handle.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackingStoreError {
    #[error("Device memory exhausted: cannot create a store of {requested} bytes")]
    OutOfDeviceMemory { requested: u64 },

    #[error("Unknown backing store {0}")]
    UnknownHandle(BackingHandle),

    #[error("Access of {len} bytes at offset {offset} is outside store {handle} ({size} bytes)")]
    OutOfBounds {
        handle: BackingHandle,
        offset: u64,
        len: u64,
        size: u64,
    },
}

/// Opaque identifier of one backing-store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackingHandle(pub u64);

impl fmt::Display for BackingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Creates, destroys and maps backing stores.
pub trait BackingStoreProvider: Send + Sync {
    /// Create a store of `size` bytes.
    fn create(&self, size: u64) -> Result<BackingHandle, BackingStoreError>;

    /// Destroy a store. The pool only calls this once no GPU work can still
    /// reference it.
    fn destroy(&self, handle: BackingHandle);

    /// Current size of a store, `None` if the handle is unknown.
    fn size(&self, handle: BackingHandle) -> Option<u64>;

    /// Write through the CPU mapping.
    fn write(&self, handle: BackingHandle, offset: u64, data: &[u8])
        -> Result<(), BackingStoreError>;

    /// Read through the CPU mapping.
    fn read(&self, handle: BackingHandle, offset: u64, out: &mut [u8])
        -> Result<(), BackingStoreError>;
}
