//! V4L2 Capture Device
//!
//! Kernel capture driver access for user-pointer streaming. Opening and
//! format queries go through the `v4l` crate; the buffer handshake uses its
//! raw ioctl layer because the high-level userptr stream allocates its own
//! memory, while here the buffers come from the DMA heap.
//!
//! ## Prerequisites
//!
//! The capture driver must support `V4L2_MEMORY_USERPTR` streaming:
//!
//! ```bash
//! v4l2-ctl -d /dev/video0 --all
//! # Device Caps should list "Video Capture" and "Streaming"
//! ```

use crate::error::{CaptureError, Result};
use crate::video::device::{CaptureDevice, CaptureFormat, InputInfo, InputType, RawBuffer};
use std::io;
use std::os::raw::{c_int, c_ulong, c_void};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use v4l::buffer::Type as BufferType;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::prelude::*;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys;
use v4l::video::Capture;

/// V4L2 video capture device in user-pointer mode
pub struct V4l2CaptureDevice {
    /// Device path (e.g., /dev/video0)
    path: PathBuf,
    /// Open device handle
    device: Device,
    /// Driver name from VIDIOC_QUERYCAP
    driver: String,
}

impl V4l2CaptureDevice {
    /// Open a capture device and check it can stream
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening V4L2 capture device {}", path.display());

        if !path.exists() {
            return Err(CaptureError::device(
                "open",
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                ),
            ));
        }

        let device = Device::with_path(&path).map_err(|e| CaptureError::device("open", e))?;
        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::device("VIDIOC_QUERYCAP", e))?;

        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE | Flags::STREAMING) {
            return Err(CaptureError::device(
                "VIDIOC_QUERYCAP",
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("{} is not a streaming capture device", path.display()),
                ),
            ));
        }

        info!(
            "V4L2 capture device opened: driver={}, card={}",
            caps.driver, caps.card
        );

        Ok(Self {
            path,
            device,
            driver: caps.driver,
        })
    }

    /// Get device path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Driver name
    pub fn driver(&self) -> &str {
        &self.driver
    }

    fn fd(&self) -> c_int {
        self.device.handle().fd()
    }

    fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        // SAFETY: every call site pairs the request with its matching
        // argument struct, and arg is a live exclusive borrow.
        unsafe { v4l2::ioctl(self.fd(), request, arg as *mut T as *mut c_void) }
    }

    /// Wait until the driver has a filled buffer
    fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let timeout_ms = timeout.map_or(-1, |t| t.as_millis().min(c_int::MAX as u128) as c_int);
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        loop {
            // SAFETY: pfd is a single valid pollfd.
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            if pfd.revents & libc::POLLERR != 0 {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            return Ok(ret > 0);
        }
    }
}

impl CaptureDevice for V4l2CaptureDevice {
    fn enum_input(&self, index: u32) -> io::Result<Option<InputInfo>> {
        // SAFETY: v4l2_input is plain old data.
        let mut input: v4l_sys::v4l2_input = unsafe { std::mem::zeroed() };
        input.index = index;

        match self.ioctl(vidioc::VIDIOC_ENUMINPUT, &mut input) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => return Ok(None),
            Err(e) => return Err(e),
        }

        let len = input.name.iter().position(|&c| c == 0).unwrap_or(input.name.len());
        let name = String::from_utf8_lossy(&input.name[..len]).into_owned();

        Ok(Some(InputInfo {
            index,
            name,
            input_type: InputType::from_raw(input.type_),
        }))
    }

    fn set_input(&mut self, index: u32) -> io::Result<()> {
        let mut raw: c_int = index as c_int;
        self.ioctl(vidioc::VIDIOC_S_INPUT, &mut raw)?;
        debug!("Selected input {} on {}", index, self.path.display());
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        // SAFETY: v4l2_requestbuffers is plain old data.
        let mut req: v4l_sys::v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        req.count = count;
        req.type_ = BufferType::VideoCapture as u32;
        req.memory = Memory::UserPtr as u32;

        self.ioctl(vidioc::VIDIOC_REQBUFS, &mut req)?;
        debug!("VIDIOC_REQBUFS: requested {}, granted {}", count, req.count);
        Ok(req.count)
    }

    unsafe fn queue_buffer(&mut self, index: u32, user_addr: usize, length: usize) -> io::Result<()> {
        let length = u32::try_from(length)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "buffer length exceeds u32"))?;

        // SAFETY: v4l2_buffer is plain old data.
        let mut buf: v4l_sys::v4l2_buffer = unsafe { std::mem::zeroed() };
        buf.index = index;
        buf.type_ = BufferType::VideoCapture as u32;
        buf.memory = Memory::UserPtr as u32;
        buf.length = length;
        buf.m.userptr = user_addr as c_ulong;

        self.ioctl(vidioc::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self, timeout: Option<Duration>) -> io::Result<Option<RawBuffer>> {
        if !self.wait_readable(timeout)? {
            return Ok(None);
        }

        // SAFETY: v4l2_buffer is plain old data.
        let mut buf: v4l_sys::v4l2_buffer = unsafe { std::mem::zeroed() };
        buf.type_ = BufferType::VideoCapture as u32;
        buf.memory = Memory::UserPtr as u32;

        self.ioctl(vidioc::VIDIOC_DQBUF, &mut buf)?;

        let timestamp = Duration::from_secs(buf.timestamp.tv_sec.max(0) as u64)
            + Duration::from_micros(buf.timestamp.tv_usec.max(0) as u64);

        Ok(Some(RawBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            timestamp,
            sequence: buf.sequence,
        }))
    }

    fn format(&self) -> io::Result<CaptureFormat> {
        let fmt = Capture::format(&self.device)?;
        Ok(CaptureFormat {
            width: fmt.width,
            height: fmt.height,
            fourcc: u32::from_le_bytes(fmt.fourcc.repr),
            bytes_per_line: fmt.stride,
            size_image: fmt.size,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut typ = BufferType::VideoCapture as u32;
        self.ioctl(vidioc::VIDIOC_STREAMON, &mut typ)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut typ = BufferType::VideoCapture as u32;
        self.ioctl(vidioc::VIDIOC_STREAMOFF, &mut typ)
    }
}

/// Find V4L2 devices that can stream video capture
pub fn find_capture_devices() -> Vec<PathBuf> {
    let mut devices = Vec::new();

    for entry in std::fs::read_dir("/dev").into_iter().flatten().flatten() {
        let path = entry.path();
        let is_video = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("video"));

        if is_video && is_capture_device(&path) {
            devices.push(path);
        }
    }

    devices.sort();
    devices
}

/// Check whether a device node supports streaming capture
fn is_capture_device(path: &Path) -> bool {
    match Device::with_path(path).and_then(|device| device.query_caps()) {
        Ok(caps) => caps
            .capabilities
            .contains(Flags::VIDEO_CAPTURE | Flags::STREAMING),
        Err(e) => {
            warn!("Skipping {}: {}", path.display(), e);
            false
        }
    }
}
