//! Error types for capture-dma-core

use std::io;
use thiserror::Error;

/// Result type alias using CaptureError
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Capture error types
///
/// Every failure is returned to the immediate caller. Nothing in this crate
/// retries a failed ioctl or allocation on its own, apart from rolling back a
/// partially allocated batch.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The physical memory heap is exhausted or misconfigured
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// The allocator subsystem was used before init or after teardown
    #[error("Allocator not initialized")]
    NotInitialized,

    /// Teardown requested while regions are still allocated
    #[error("Allocator busy: {0} regions still allocated")]
    AllocatorBusy(usize),

    /// One or more regions could not be returned to the heap
    #[error("Failed to release {failures} of {total} regions")]
    ReleaseFailed {
        /// Number of regions whose release reported an error
        failures: usize,
        /// Number of regions the release covered
        total: usize,
    },

    /// The driver rejected a request
    #[error("Device error during {op}: {source}")]
    Device {
        /// Driver operation that failed (e.g. "VIDIOC_QBUF")
        op: &'static str,
        /// OS error reported by the driver
        #[source]
        source: io::Error,
    },

    /// The driver granted a different buffer count than requested
    #[error("Driver granted {granted} buffers, {requested} requested")]
    UnsupportedBufferCount {
        /// Buffers requested from the driver
        requested: u32,
        /// Buffers the driver agreed to
        granted: u32,
    },

    /// Operation called outside the session state it requires
    #[error("{op} not allowed while session is {state}")]
    InvalidState {
        /// Operation that was refused
        op: &'static str,
        /// Session state (or buffer owner) at the time of the call
        state: String,
    },

    /// A blocking dequeue exceeded its bound
    #[error("Operation timed out")]
    Timeout,

    /// Caller passed a value the operation cannot accept
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CaptureError {
    /// Create an Allocation error
    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::Allocation(msg.into())
    }

    /// Create a Device error for the given driver operation
    pub fn device(op: &'static str, source: io::Error) -> Self {
        Self::Device { op, source }
    }

    /// Create an InvalidState error
    pub fn invalid_state(op: &'static str, state: impl ToString) -> Self {
        Self::InvalidState {
            op,
            state: state.to_string(),
        }
    }

    /// Create an InvalidArgument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a Config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the caller may simply re-issue the operation
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Allocation(_))
    }

    /// OS error code behind a Device error, if any
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::Device { source, .. } => source.raw_os_error(),
            Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = CaptureError::allocation("heap exhausted");
        assert!(matches!(err, CaptureError::Allocation(_)));
    }

    #[test]
    fn test_error_display() {
        let err = CaptureError::UnsupportedBufferCount {
            requested: 4,
            granted: 2,
        };
        assert_eq!(err.to_string(), "Driver granted 2 buffers, 4 requested");

        let err = CaptureError::invalid_state("dequeue", "Idle");
        assert_eq!(err.to_string(), "dequeue not allowed while session is Idle");
    }

    #[test]
    fn test_device_error_keeps_os_code() {
        let err = CaptureError::device("VIDIOC_STREAMON", io::Error::from_raw_os_error(libc::EBUSY));
        assert_eq!(err.os_error(), Some(libc::EBUSY));
        assert!(err.to_string().contains("VIDIOC_STREAMON"));
    }

    #[test]
    fn test_recoverable() {
        assert!(CaptureError::Timeout.is_recoverable());
        assert!(!CaptureError::NotInitialized.is_recoverable());
    }
}
