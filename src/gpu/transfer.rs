//! Device-side copy contract used by copy-on-write growth.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gpu::backing::{BackingHandle, BackingStoreError};
use crate::gpu::fence::SharedFence;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Copy submission failed: {0}")]
    SubmitFailed(String),

    #[error("Copy range {start}..{end} does not fit the destination ({dst_size} bytes)")]
    RangeOutOfBounds { start: u64, end: u64, dst_size: u64 },

    #[error(transparent)]
    Backing(#[from] BackingStoreError),
}

/// Records and submits a device-side copy.
pub trait CopyEngine: Send + Sync {
    /// Copy `range` of `src` to the same offsets in `dst`.
    ///
    /// Returns the fence that signals once the copy has executed.
    fn copy(
        &self,
        src: BackingHandle,
        dst: BackingHandle,
        range: Range<u64>,
    ) -> Result<SharedFence, TransferError>;
}

/// Copy counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub total_copies: u64,
    pub total_bytes: u64,
    pub failed_copies: u64,
}
