//! Simulated Capture Driver
//!
//! An in-process stand-in for a V4L2 user-pointer capture driver. It keeps
//! the same queue discipline as the kernel (FIFO fill order, stream-off
//! returns every buffer, buffer count changes refused while streaming) and
//! writes a fill pattern into queued user memory on each dequeue.
//!
//! Failures are injected through a [`FaultInjector`] that stays usable after
//! the device has been moved into a session.

use crate::video::device::{CaptureDevice, CaptureFormat, InputInfo, InputType, RawBuffer};
use crate::video::frame::PixelFormat;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Kernel limit on capture buffers (VIDEO_MAX_FRAME)
pub const MAX_BUFFERS: u32 = 32;

/// Default frame interval (30 fps)
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_micros(33_333);

/// Driver operation, for fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceOp {
    EnumInput,
    SetInput,
    RequestBuffers,
    QueueBuffer,
    DequeueBuffer,
    Format,
    StreamOn,
    StreamOff,
}

impl fmt::Display for DeviceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceOp::EnumInput => "VIDIOC_ENUMINPUT",
            DeviceOp::SetInput => "VIDIOC_S_INPUT",
            DeviceOp::RequestBuffers => "VIDIOC_REQBUFS",
            DeviceOp::QueueBuffer => "VIDIOC_QBUF",
            DeviceOp::DequeueBuffer => "VIDIOC_DQBUF",
            DeviceOp::Format => "VIDIOC_G_FMT",
            DeviceOp::StreamOn => "VIDIOC_STREAMON",
            DeviceOp::StreamOff => "VIDIOC_STREAMOFF",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Default)]
struct FaultTable {
    ops: HashMap<DeviceOp, i32>,
    queue_index: Option<(u32, i32)>,
    stalled: bool,
}

/// Shared switchboard of injected driver failures
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    inner: Arc<Mutex<FaultTable>>,
}

impl FaultInjector {
    /// Make every call of `op` fail with `errno` until cleared
    pub fn fail(&self, op: DeviceOp, errno: i32) {
        self.table().ops.insert(op, errno);
    }

    /// Make queueing buffer `index` fail with `errno` until cleared
    pub fn fail_queue_at(&self, index: u32, errno: i32) {
        self.table().queue_index = Some((index, errno));
    }

    /// Stop delivering frames; dequeue times out while stalled
    pub fn stall(&self, stalled: bool) {
        self.table().stalled = stalled;
    }

    /// Remove the fault on `op`
    pub fn clear(&self, op: DeviceOp) {
        let mut table = self.table();
        table.ops.remove(&op);
        if op == DeviceOp::QueueBuffer {
            table.queue_index = None;
        }
    }

    /// Remove every fault
    pub fn clear_all(&self) {
        *self.table() = FaultTable::default();
    }

    fn table(&self) -> std::sync::MutexGuard<'_, FaultTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, op: DeviceOp) -> io::Result<()> {
        match self.table().ops.get(&op) {
            Some(&errno) => {
                debug!("Injected {} failure (errno {})", op, errno);
                Err(io::Error::from_raw_os_error(errno))
            }
            None => Ok(()),
        }
    }

    fn check_queue(&self, index: u32) -> io::Result<()> {
        self.check(DeviceOp::QueueBuffer)?;
        match self.table().queue_index {
            Some((at, errno)) if at == index => Err(io::Error::from_raw_os_error(errno)),
            _ => Ok(()),
        }
    }

    fn is_stalled(&self) -> bool {
        self.table().stalled
    }
}

#[derive(Debug, Clone, Copy)]
struct QueuedBuffer {
    index: u32,
    user_addr: usize,
    length: usize,
}

/// In-process capture driver
#[derive(Debug)]
pub struct SimulatedDevice {
    inputs: Vec<InputInfo>,
    current_input: u32,
    format: CaptureFormat,
    max_buffers: u32,
    granted_override: Option<u32>,
    payload: Option<usize>,
    frame_interval: Duration,

    allocated: u32,
    queue: VecDeque<QueuedBuffer>,
    streaming: bool,
    clock: Duration,
    sequence: u32,

    faults: FaultInjector,
    ioctl_count: AtomicU64,
    frames_delivered: u64,
}

impl SimulatedDevice {
    /// Create a driver producing `width` x `height` frames in `format`
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let pitch = format.bytes_per_line(width);
        Self {
            inputs: vec![
                InputInfo {
                    index: 0,
                    name: "Camera 0".to_string(),
                    input_type: InputType::Camera,
                },
                InputInfo {
                    index: 1,
                    name: "Tuner 0".to_string(),
                    input_type: InputType::Tuner,
                },
            ],
            current_input: 0,
            format: CaptureFormat {
                width,
                height,
                fourcc: format.fourcc(),
                bytes_per_line: pitch,
                size_image: format.frame_size(pitch, height) as u32,
            },
            max_buffers: MAX_BUFFERS,
            granted_override: None,
            payload: None,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            allocated: 0,
            queue: VecDeque::new(),
            streaming: false,
            clock: Duration::ZERO,
            sequence: 0,
            faults: FaultInjector::default(),
            ioctl_count: AtomicU64::new(0),
            frames_delivered: 0,
        }
    }

    /// Replace the enumerated inputs
    pub fn with_inputs(mut self, inputs: Vec<InputInfo>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Report a padded line pitch
    pub fn with_line_pitch(mut self, bytes_per_line: u32) -> Self {
        let format = PixelFormat::from_fourcc(self.format.fourcc).unwrap_or_default();
        self.format.bytes_per_line = bytes_per_line;
        self.format.size_image = format.frame_size(bytes_per_line, self.format.height) as u32;
        self
    }

    /// Cap the buffer count the driver grants
    pub fn with_max_buffers(mut self, max: u32) -> Self {
        self.max_buffers = max;
        self
    }

    /// Grant exactly `count` buffers for any non-zero request
    pub fn with_granted_count(mut self, count: u32) -> Self {
        self.granted_override = Some(count);
        self
    }

    /// Bytes written per frame (defaults to the format's image size)
    pub fn with_payload(mut self, bytes: usize) -> Self {
        self.payload = Some(bytes);
        self
    }

    /// Spacing of capture timestamps
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Handle for injecting failures
    pub fn faults(&self) -> FaultInjector {
        self.faults.clone()
    }

    /// Whether the driver is streaming
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Buffer count currently negotiated
    pub fn allocated_buffers(&self) -> u32 {
        self.allocated
    }

    /// Buffers currently queued to the driver
    pub fn queued_buffers(&self) -> usize {
        self.queue.len()
    }

    /// Selected input
    pub fn current_input(&self) -> u32 {
        self.current_input
    }

    /// Frames handed back through dequeue
    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    /// Total driver calls of any kind
    pub fn ioctl_count(&self) -> u64 {
        self.ioctl_count.load(Ordering::Relaxed)
    }

    fn enter(&self, op: DeviceOp) -> io::Result<()> {
        self.ioctl_count.fetch_add(1, Ordering::Relaxed);
        self.faults.check(op)
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl CaptureDevice for SimulatedDevice {
    fn enum_input(&self, index: u32) -> io::Result<Option<InputInfo>> {
        self.enter(DeviceOp::EnumInput)?;
        Ok(self.inputs.get(index as usize).cloned())
    }

    fn set_input(&mut self, index: u32) -> io::Result<()> {
        self.enter(DeviceOp::SetInput)?;
        if self.streaming {
            return Err(errno(libc::EBUSY));
        }
        match self.inputs.get(index as usize) {
            Some(input) if input.input_type == InputType::Camera => {
                self.current_input = index;
                Ok(())
            }
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.enter(DeviceOp::RequestBuffers)?;
        if self.streaming {
            return Err(errno(libc::EBUSY));
        }

        self.queue.clear();
        self.allocated = if count == 0 {
            0
        } else {
            self.granted_override
                .unwrap_or_else(|| count.min(self.max_buffers))
        };
        Ok(self.allocated)
    }

    unsafe fn queue_buffer(&mut self, index: u32, user_addr: usize, length: usize) -> io::Result<()> {
        self.ioctl_count.fetch_add(1, Ordering::Relaxed);
        self.faults.check_queue(index)?;

        if index >= self.allocated || user_addr == 0 || length == 0 {
            return Err(errno(libc::EINVAL));
        }
        if self.queue.iter().any(|q| q.index == index) {
            return Err(errno(libc::EINVAL));
        }

        self.queue.push_back(QueuedBuffer {
            index,
            user_addr,
            length,
        });
        Ok(())
    }

    /// Frames are produced on demand, so a timeout only happens when nothing
    /// is queued or the stream is stalled, and it is reported immediately.
    fn dequeue_buffer(&mut self, _timeout: Option<Duration>) -> io::Result<Option<RawBuffer>> {
        self.enter(DeviceOp::DequeueBuffer)?;
        if !self.streaming {
            return Err(errno(libc::EINVAL));
        }
        if self.faults.is_stalled() {
            return Ok(None);
        }

        let Some(buffer) = self.queue.pop_front() else {
            return Ok(None);
        };

        let payload = self
            .payload
            .unwrap_or(self.format.size_image as usize)
            .min(buffer.length);

        // SAFETY: the queue_buffer contract keeps the region valid and
        // untouched by its owner until this dequeue hands it back.
        unsafe {
            std::ptr::write_bytes(buffer.user_addr as *mut u8, self.sequence as u8, payload);
        }

        self.clock += self.frame_interval;
        let raw = RawBuffer {
            index: buffer.index,
            bytes_used: payload as u32,
            timestamp: self.clock,
            sequence: self.sequence,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.frames_delivered += 1;
        Ok(Some(raw))
    }

    fn format(&self) -> io::Result<CaptureFormat> {
        self.enter(DeviceOp::Format)?;
        Ok(self.format)
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.enter(DeviceOp::StreamOn)?;
        if self.allocated == 0 {
            return Err(errno(libc::EINVAL));
        }
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.enter(DeviceOp::StreamOff)?;
        self.streaming = false;
        self.queue.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grants_up_to_max() {
        let mut dev = SimulatedDevice::new(64, 8, PixelFormat::UYVY).with_max_buffers(3);
        assert_eq!(dev.request_buffers(8).unwrap(), 3);
        assert_eq!(dev.request_buffers(0).unwrap(), 0);
    }

    #[test]
    fn test_fifo_fill_order() {
        let mut dev = SimulatedDevice::new(8, 2, PixelFormat::GREY);
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];

        dev.request_buffers(2).unwrap();
        unsafe {
            dev.queue_buffer(1, b.as_mut_ptr() as usize, b.len()).unwrap();
            dev.queue_buffer(0, a.as_mut_ptr() as usize, a.len()).unwrap();
        }
        dev.stream_on().unwrap();

        let first = dev.dequeue_buffer(None).unwrap().unwrap();
        let second = dev.dequeue_buffer(None).unwrap().unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(second.index, 0);
        assert_eq!(second.sequence, 1);
        assert!(second.timestamp > first.timestamp);
        assert_eq!(a, vec![1u8; 16]);

        // Nothing queued
        assert!(dev.dequeue_buffer(None).unwrap().is_none());
        dev.stream_off().unwrap();
    }

    #[test]
    fn test_rejects_double_queue() {
        let mut dev = SimulatedDevice::new(8, 2, PixelFormat::GREY);
        let mut a = vec![0u8; 16];
        dev.request_buffers(1).unwrap();

        unsafe {
            dev.queue_buffer(0, a.as_mut_ptr() as usize, a.len()).unwrap();
            let err = dev.queue_buffer(0, a.as_mut_ptr() as usize, a.len()).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        }
    }

    #[test]
    fn test_fault_injection() {
        let mut dev = SimulatedDevice::new(8, 2, PixelFormat::GREY);
        let faults = dev.faults();

        faults.fail(DeviceOp::RequestBuffers, libc::ENOMEM);
        let err = dev.request_buffers(2).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));

        faults.clear(DeviceOp::RequestBuffers);
        assert_eq!(dev.request_buffers(2).unwrap(), 2);
    }

    #[test]
    fn test_set_input_requires_camera() {
        let mut dev = SimulatedDevice::new(8, 2, PixelFormat::GREY);
        assert!(dev.set_input(0).is_ok());
        assert!(dev.set_input(1).is_err());
        assert!(dev.set_input(7).is_err());
        assert_eq!(dev.current_input(), 0);
    }
}
