//! Device error types

use thiserror::Error;

use super::{DevicePtr, StreamId};

/// Errors reported by a device context
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Invalid device pointer: {0}")]
    InvalidPointer(DevicePtr),

    #[error("Access of {size} bytes at {ptr} exceeds its allocation")]
    OutOfBounds { ptr: DevicePtr, size: usize },

    #[error("Invalid stream: {0}")]
    InvalidStream(StreamId),

    #[error("Kernel launch failed: {0}")]
    LaunchFailed(String),

    #[error("Device {0} could not be bound to the current thread")]
    BindFailed(u32),
}

impl DeviceError {
    /// Transient errors that may succeed if the whole run is retried
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DeviceError::OutOfMemory { .. } | DeviceError::LaunchFailed(_)
        )
    }
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;
