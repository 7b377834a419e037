//! Error types for trueno-varray-core.

use thiserror::Error;

use crate::page::DeviceId;

/// Errors that can occur while constructing or accessing a virtual array.
#[derive(Debug, Error)]
pub enum Error {
    /// Index outside `[0, len)`.
    #[error("index {index} out of range for array of length {len}")]
    OutOfRange {
        /// Requested index.
        index: usize,
        /// Array length.
        len: usize,
    },

    /// A fetch or write-back between host and device did not complete.
    #[error("transfer failure on {device}: {reason}")]
    TransferFailure {
        /// Device the transfer targeted.
        device: DeviceId,
        /// Description reported by the device.
        reason: String,
    },

    /// Invalid construction parameters.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Device could not provide backing storage.
    #[error("allocation of {bytes} bytes failed on {device}: {reason}")]
    AllocationFailure {
        /// Device the allocation targeted.
        device: DeviceId,
        /// Requested size.
        bytes: usize,
        /// Description reported by the device.
        reason: String,
    },

    /// One or more channels failed to write back their dirty pages.
    #[error("flush failed on {} of {total} channels", .failures.len())]
    FlushFailed {
        /// Per-channel failures, in channel order.
        failures: Vec<Error>,
        /// Number of channels that were flushed.
        total: usize,
    },

    /// I/O error (configuration files).
    #[error("I/O error: {0}")]
    IoError(String),
}

impl Error {
    /// Build a transfer failure for `device`.
    pub(crate) fn transfer(device: DeviceId, reason: impl Into<String>) -> Self {
        Self::TransferFailure {
            device,
            reason: reason.into(),
        }
    }

    /// Whether this error (or any aggregated error) is a transfer failure.
    #[must_use]
    pub fn is_transfer_failure(&self) -> bool {
        match self {
            Self::TransferFailure { .. } => true,
            Self::FlushFailed { failures, .. } => failures.iter().any(Self::is_transfer_failure),
            _ => false,
        }
    }
}

/// Result type for virtual array operations.
pub type Result<T> = std::result::Result<T, Error>;
