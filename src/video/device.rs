//! Capture Device Boundary
//!
//! The seven driver operations the capture session is built on. Every
//! operation maps onto one V4L2 ioctl and reports failures as
//! [`std::io::Error`] carrying the OS error code.

use std::fmt;
use std::io;
use std::time::Duration;

/// Kind of a video input, as reported by input enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    /// Analog tuner
    Tuner,
    /// Camera or video decoder input
    Camera,
    /// Touch sensor
    Touch,
    /// Anything else the driver reports
    Other(u32),
}

impl InputType {
    /// Map a raw `v4l2_input.type` value
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => InputType::Tuner,
            2 => InputType::Camera,
            3 => InputType::Touch,
            other => InputType::Other(other),
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputType::Tuner => write!(f, "tuner"),
            InputType::Camera => write!(f, "camera"),
            InputType::Touch => write!(f, "touch"),
            InputType::Other(raw) => write!(f, "type {}", raw),
        }
    }
}

/// One enumerated input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputInfo {
    /// Input index
    pub index: u32,
    /// Name reported by the driver
    pub name: String,
    /// Input kind
    pub input_type: InputType,
}

/// Negotiated capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// V4L2 fourcc
    pub fourcc: u32,
    /// Bytes per line of the first plane
    pub bytes_per_line: u32,
    /// Bytes per frame the driver expects
    pub size_image: u32,
}

/// A buffer handed back by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBuffer {
    /// Buffer index
    pub index: u32,
    /// Payload length written by the device
    pub bytes_used: u32,
    /// Capture timestamp
    pub timestamp: Duration,
    /// Driver frame sequence number
    pub sequence: u32,
}

/// Video capture driver operations (user-pointer memory, single plane)
pub trait CaptureDevice: Send {
    /// Query input `index`; `Ok(None)` once past the last input
    fn enum_input(&self, index: u32) -> io::Result<Option<InputInfo>>;

    /// Select the active input
    fn set_input(&mut self, index: u32) -> io::Result<()>;

    /// Negotiate `count` user-pointer capture buffers, returning the count
    /// the driver granted. A count of zero releases every binding.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// Hand buffer `index` to the driver for filling
    ///
    /// # Safety
    ///
    /// `user_addr..user_addr + length` must be valid writable memory that
    /// stays allocated, and is neither read nor written by the caller, until
    /// the buffer is dequeued, streaming is stopped, or the buffer count is
    /// reset to zero.
    unsafe fn queue_buffer(&mut self, index: u32, user_addr: usize, length: usize) -> io::Result<()>;

    /// Wait for a filled buffer; `Ok(None)` when `timeout` expires first.
    /// A `None` timeout waits indefinitely.
    ///
    /// Only called while at least one buffer is queued. V4L2 reports an
    /// empty queue as `POLLERR`, which backends surface as an error.
    fn dequeue_buffer(&mut self, timeout: Option<Duration>) -> io::Result<Option<RawBuffer>>;

    /// Read the current capture format
    fn format(&self) -> io::Result<CaptureFormat>;

    /// Start filling queued buffers
    fn stream_on(&mut self) -> io::Result<()>;

    /// Stop filling; every queued buffer returns to userspace
    fn stream_off(&mut self) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_type_from_raw() {
        assert_eq!(InputType::from_raw(2), InputType::Camera);
        assert_eq!(InputType::from_raw(1), InputType::Tuner);
        assert_eq!(InputType::from_raw(9), InputType::Other(9));
        assert_eq!(InputType::Camera.to_string(), "camera");
    }
}
