//! Capture Session
//!
//! Drives the user-pointer capture handshake with one device:
//!
//! ```text
//! Idle --register_buffers--> BuffersRegistered --start_streaming--> Streaming
//!  ^                              |       ^                             |
//!  +------unregister_buffers------+       +-------stop_streaming--------+
//! ```
//!
//! While registered the session owns the [`BufferPool`], so its memory cannot
//! be freed behind the driver's back. Each buffer carries an ownership token:
//! `Driver` while queued, `Client` once dequeued. Only `Client` buffers can be
//! read or re-queued.
//!
//! ## Usage
//!
//! ```rust
//! use capture_dma_core::memory::{Allocator, BufferPool, HostHeap};
//! use capture_dma_core::video::{CaptureSession, PixelFormat, SimulatedDevice};
//!
//! # fn main() -> capture_dma_core::Result<()> {
//! let allocator = Allocator::new(HostHeap::new())?;
//! let pool = BufferPool::create(&allocator, 65536, 4)?;
//!
//! let mut session = CaptureSession::new(SimulatedDevice::new(640, 480, PixelFormat::UYVY));
//! session.register_buffers(pool, 640, 480)?;
//! session.start_streaming()?;
//!
//! let buffer = session.dequeue()?;
//! let frame = session.frame(buffer.index)?;
//! assert!(frame.bytes_used() <= 65536);
//! session.enqueue(buffer.index)?;
//!
//! session.stop_streaming()?;
//! session.unregister_buffers()?.destroy()?;
//! # Ok(())
//! # }
//! ```

use crate::error::{CaptureError, Result};
use crate::memory::BufferPool;
use crate::video::device::{CaptureDevice, CaptureFormat, InputInfo, InputType};
use crate::video::frame::FrameView;
use std::fmt;
use std::io;
use std::iter::FusedIterator;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default bound on a blocking dequeue
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on enumerated inputs, in case a driver never reports the end
const MAX_INPUTS: u32 = 256;

/// Capture session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No buffers registered with the driver
    Idle,
    /// Buffers negotiated and queued, not streaming
    BuffersRegistered,
    /// Driver is filling buffers
    Streaming,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::BuffersRegistered => write!(f, "BuffersRegistered"),
            SessionState::Streaming => write!(f, "Streaming"),
        }
    }
}

/// Who may touch a registered buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    /// Queued; the device may write it
    Driver,
    /// Dequeued; the caller may read it
    Client,
}

impl fmt::Display for BufferOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferOwner::Driver => write!(f, "held by driver"),
            BufferOwner::Client => write!(f, "held by client"),
        }
    }
}

/// A filled buffer returned by [`CaptureSession::dequeue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Buffer index, to pass back to `enqueue`
    pub index: usize,
    /// Valid payload length
    pub bytes_used: usize,
    /// Capture timestamp
    pub timestamp: Duration,
    /// Driver sequence number
    pub sequence: u32,
}

/// Snapshot of one registered buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: usize,
    pub user_addr: usize,
    pub phys_addr: u64,
    pub size: usize,
    pub bytes_used: usize,
    pub width: u32,
    pub height: u32,
    pub owner: BufferOwner,
}

/// Failed registration, carrying the pool back to the caller
///
/// `pool` is `None` only when the driver refused to release buffers it had
/// already been given; that memory is then leaked rather than freed while
/// the device may still write to it.
#[derive(Debug)]
pub struct RegisterError {
    error: CaptureError,
    pool: Option<BufferPool>,
}

impl RegisterError {
    fn new(error: CaptureError, pool: BufferPool) -> Self {
        Self {
            error,
            pool: Some(pool),
        }
    }

    /// Underlying error
    pub fn error(&self) -> &CaptureError {
        &self.error
    }

    /// Take the pool back, if it was recoverable
    pub fn into_pool(self) -> Option<BufferPool> {
        self.pool
    }

    /// Split into error and pool
    pub fn into_parts(self) -> (CaptureError, Option<BufferPool>) {
        (self.error, self.pool)
    }

    /// Drop the pool (freeing it) and keep the error
    pub fn into_error(self) -> CaptureError {
        self.error
    }
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer registration failed: {}", self.error)
    }
}

impl std::error::Error for RegisterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<RegisterError> for CaptureError {
    fn from(err: RegisterError) -> Self {
        err.error
    }
}

#[derive(Debug)]
struct Registration {
    pool: BufferPool,
    owners: Vec<BufferOwner>,
}

/// Capture session over one device
pub struct CaptureSession<D: CaptureDevice> {
    device: D,
    registration: Option<Registration>,
    streaming: bool,
    dequeue_timeout: Option<Duration>,
}

impl<D: CaptureDevice> CaptureSession<D> {
    /// Create an idle session with the default dequeue timeout
    pub fn new(device: D) -> Self {
        Self::with_timeout(device, Some(DEFAULT_DEQUEUE_TIMEOUT))
    }

    /// Create an idle session; a `None` timeout makes `dequeue` wait forever
    pub fn with_timeout(device: D, dequeue_timeout: Option<Duration>) -> Self {
        Self {
            device,
            registration: None,
            streaming: false,
            dequeue_timeout,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        match (&self.registration, self.streaming) {
            (None, _) => SessionState::Idle,
            (Some(_), false) => SessionState::BuffersRegistered,
            (Some(_), true) => SessionState::Streaming,
        }
    }

    /// Underlying device
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Configured dequeue bound
    pub fn dequeue_timeout_setting(&self) -> Option<Duration> {
        self.dequeue_timeout
    }

    /// Change the dequeue bound for later `dequeue` calls
    pub fn set_dequeue_timeout(&mut self, timeout: Option<Duration>) {
        self.dequeue_timeout = timeout;
    }

    fn require(&self, op: &'static str, allowed: &[SessionState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            debug!("Refusing {} in state {}", op, state);
            Err(CaptureError::invalid_state(op, state))
        }
    }

    /// Iterate the device's inputs, starting from index 0
    ///
    /// Each call starts a fresh enumeration.
    pub fn enumerate_inputs(&self) -> Inputs<'_, D> {
        Inputs {
            device: &self.device,
            next: 0,
            done: false,
        }
    }

    /// Select a camera input by its enumerated index
    pub fn select_input(&mut self, index: u32) -> Result<()> {
        self.require("select_input", &[SessionState::Idle])?;

        match self.device.enum_input(index) {
            Ok(Some(info)) if info.input_type != InputType::Camera => {
                return Err(CaptureError::device(
                    "VIDIOC_S_INPUT",
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("input {} ({}) is a {} input", index, info.name, info.input_type),
                    ),
                ));
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(CaptureError::device(
                    "VIDIOC_S_INPUT",
                    io::Error::from_raw_os_error(libc::EINVAL),
                ));
            }
            Err(e) => return Err(CaptureError::device("VIDIOC_ENUMINPUT", e)),
        }

        self.device
            .set_input(index)
            .map_err(|e| CaptureError::device("VIDIOC_S_INPUT", e))?;

        info!("Selected capture input {}", index);
        Ok(())
    }

    /// Negotiate the pool's buffer count with the driver and queue every buffer
    ///
    /// On failure no registration remains and the pool comes back in the
    /// error (see [`RegisterError`]).
    pub fn register_buffers(
        &mut self,
        mut pool: BufferPool,
        width: u32,
        height: u32,
    ) -> std::result::Result<(), RegisterError> {
        if let Err(e) = self.require("register_buffers", &[SessionState::Idle]) {
            return Err(RegisterError::new(e, pool));
        }

        let requested = match u32::try_from(pool.len()) {
            Ok(n) => n,
            Err(_) => {
                return Err(RegisterError::new(
                    CaptureError::invalid_argument("pool too large for the driver"),
                    pool,
                ))
            }
        };

        let granted = match self.device.request_buffers(requested) {
            Ok(n) => n,
            Err(e) => {
                return Err(RegisterError::new(
                    CaptureError::device("VIDIOC_REQBUFS", e),
                    pool,
                ))
            }
        };

        if granted != requested {
            warn!(
                "Driver granted {} buffers, {} requested; releasing",
                granted, requested
            );
            if let Err(e) = self.device.request_buffers(0) {
                warn!("Failed to reset buffer count: {}", e);
            }
            return Err(RegisterError::new(
                CaptureError::UnsupportedBufferCount { requested, granted },
                pool,
            ));
        }

        for desc in pool.descriptors_mut() {
            desc.set_geometry(width, height);
        }

        for index in 0..pool.len() {
            let (user_addr, phys_addr, size) = match pool.descriptor(index) {
                Some(desc) => (desc.user_addr(), desc.phys_addr(), desc.size()),
                None => (0, 0, 0),
            };
            if user_addr == 0 || phys_addr == 0 {
                let err = CaptureError::invalid_argument(format!("buffer {} has no backing memory", index));
                return Err(self.abort_registration(err, pool));
            }

            // SAFETY: the region lives in `pool`, which either moves into the
            // session below or is only handed back after the driver has
            // released every binding.
            let queued = unsafe { self.device.queue_buffer(index as u32, user_addr, size) };
            if let Err(e) = queued {
                error!("Failed to queue buffer {}: {}", index, e);
                return Err(self.abort_registration(CaptureError::device("VIDIOC_QBUF", e), pool));
            }
        }

        info!(
            "Registered {} buffers of {} bytes ({}x{})",
            requested,
            pool.buffer_size(),
            width,
            height
        );

        let owners = vec![BufferOwner::Driver; pool.len()];
        self.registration = Some(Registration { pool, owners });
        Ok(())
    }

    /// Undo a partial registration after some buffers were queued
    fn abort_registration(&mut self, error: CaptureError, pool: BufferPool) -> RegisterError {
        match self.device.request_buffers(0) {
            Ok(_) => RegisterError::new(error, pool),
            Err(e) => {
                error!(
                    "Driver refused to release buffers ({}); leaking {} buffers",
                    e,
                    pool.len()
                );
                std::mem::forget(pool);
                RegisterError { error, pool: None }
            }
        }
    }

    /// Release every buffer binding and return the pool
    pub fn unregister_buffers(&mut self) -> Result<BufferPool> {
        self.require("unregister_buffers", &[SessionState::BuffersRegistered])?;

        self.device
            .request_buffers(0)
            .map_err(|e| CaptureError::device("VIDIOC_REQBUFS", e))?;

        let registration = self
            .registration
            .take()
            .ok_or_else(|| CaptureError::invalid_state("unregister_buffers", SessionState::Idle))?;

        info!("Unregistered {} buffers", registration.pool.len());
        Ok(registration.pool)
    }

    /// Start the device filling queued buffers
    pub fn start_streaming(&mut self) -> Result<()> {
        self.require("start_streaming", &[SessionState::BuffersRegistered])?;

        if self.buffers_held_by_driver() == 0 {
            return Err(CaptureError::invalid_state(
                "start_streaming",
                "BuffersRegistered with no buffers queued",
            ));
        }

        self.device
            .stream_on()
            .map_err(|e| CaptureError::device("VIDIOC_STREAMON", e))?;

        self.streaming = true;
        info!("Streaming started");
        Ok(())
    }

    /// Stop streaming; every queued buffer comes back to the caller
    pub fn stop_streaming(&mut self) -> Result<()> {
        self.require("stop_streaming", &[SessionState::Streaming])?;

        self.device
            .stream_off()
            .map_err(|e| CaptureError::device("VIDIOC_STREAMOFF", e))?;

        self.streaming = false;
        if let Some(reg) = self.registration.as_mut() {
            reg.owners.fill(BufferOwner::Client);
        }
        info!("Streaming stopped");
        Ok(())
    }

    /// Negotiated capture format
    pub fn capture_format(&self) -> Result<CaptureFormat> {
        self.device
            .format()
            .map_err(|e| CaptureError::device("VIDIOC_G_FMT", e))
    }

    /// Bytes per line the driver will write
    pub fn query_line_pitch(&self) -> Result<u32> {
        self.capture_format().map(|f| f.bytes_per_line)
    }

    /// Wait for a filled buffer using the configured timeout
    pub fn dequeue(&mut self) -> Result<DequeuedBuffer> {
        self.dequeue_timeout(self.dequeue_timeout)
    }

    /// Wait for a filled buffer; `None` waits indefinitely
    ///
    /// While the caller holds every buffer nothing can be filled, so this
    /// returns [`CaptureError::Timeout`] at once without asking the driver.
    pub fn dequeue_timeout(&mut self, timeout: Option<Duration>) -> Result<DequeuedBuffer> {
        self.require("dequeue", &[SessionState::Streaming])?;

        if self.buffers_held_by_driver() == 0 {
            debug!("Dequeue with no buffer queued");
            return Err(CaptureError::Timeout);
        }

        let raw = self
            .device
            .dequeue_buffer(timeout)
            .map_err(|e| CaptureError::device("VIDIOC_DQBUF", e))?
            .ok_or(CaptureError::Timeout)?;

        let reg = self
            .registration
            .as_mut()
            .ok_or_else(|| CaptureError::invalid_state("dequeue", SessionState::Idle))?;

        let index = raw.index as usize;
        if reg.owners.get(index) != Some(&BufferOwner::Driver) {
            return Err(CaptureError::device(
                "VIDIOC_DQBUF",
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("driver returned buffer {} it does not hold", index),
                ),
            ));
        }

        reg.owners[index] = BufferOwner::Client;
        let bytes_used = raw.bytes_used as usize;

        if let Some(desc) = reg.pool.descriptor_mut(index) {
            desc.record_fill(bytes_used, raw.timestamp, raw.sequence);
        }

        debug!(
            "Dequeued buffer {} ({} bytes, seq {})",
            index, bytes_used, raw.sequence
        );

        Ok(DequeuedBuffer {
            index,
            bytes_used: bytes_used.min(reg.pool.buffer_size()),
            timestamp: raw.timestamp,
            sequence: raw.sequence,
        })
    }

    /// Hand a dequeued buffer back to the driver
    pub fn enqueue(&mut self, index: usize) -> Result<()> {
        let state = self.state();
        self.require("enqueue", &[SessionState::BuffersRegistered, SessionState::Streaming])?;

        let reg = self
            .registration
            .as_mut()
            .ok_or_else(|| CaptureError::invalid_state("enqueue", state))?;

        match reg.owners.get(index) {
            None => {
                return Err(CaptureError::invalid_argument(format!(
                    "buffer index {} out of range (0..{})",
                    index,
                    reg.owners.len()
                )))
            }
            Some(BufferOwner::Driver) => {
                return Err(CaptureError::invalid_state(
                    "enqueue",
                    format!("{} with buffer {} {}", state, index, BufferOwner::Driver),
                ))
            }
            Some(BufferOwner::Client) => {}
        }

        let (user_addr, size) = reg
            .pool
            .descriptor(index)
            .map(|desc| (desc.user_addr(), desc.size()))
            .ok_or_else(|| CaptureError::invalid_argument(format!("no buffer {}", index)))?;

        // SAFETY: the pool is owned by the session while registered, and the
        // Driver token below keeps `frame` from reading the region until it
        // is dequeued again.
        unsafe {
            self.device
                .queue_buffer(index as u32, user_addr, size)
                .map_err(|e| CaptureError::device("VIDIOC_QBUF", e))?;
        }

        reg.owners[index] = BufferOwner::Driver;
        debug!("Queued buffer {}", index);
        Ok(())
    }

    /// Read-only view of a buffer held by the caller
    pub fn frame(&self, index: usize) -> Result<FrameView<'_>> {
        let state = self.state();
        let reg = self
            .registration
            .as_ref()
            .ok_or_else(|| CaptureError::invalid_state("frame", state))?;

        match reg.owners.get(index) {
            None => Err(CaptureError::invalid_argument(format!(
                "buffer index {} out of range (0..{})",
                index,
                reg.owners.len()
            ))),
            Some(BufferOwner::Driver) => Err(CaptureError::invalid_state(
                "frame",
                format!("{} with buffer {} {}", state, index, BufferOwner::Driver),
            )),
            Some(BufferOwner::Client) => {
                let desc = reg
                    .pool
                    .descriptor(index)
                    .ok_or_else(|| CaptureError::invalid_argument(format!("no buffer {}", index)))?;
                Ok(FrameView {
                    index,
                    data: desc.data(),
                    width: desc.width(),
                    height: desc.height(),
                    timestamp: desc.timestamp(),
                    sequence: desc.sequence(),
                })
            }
        }
    }

    /// Ownership token of a registered buffer
    pub fn owner(&self, index: usize) -> Option<BufferOwner> {
        self.registration
            .as_ref()
            .and_then(|reg| reg.owners.get(index).copied())
    }

    /// Number of registered buffers (0 when idle)
    pub fn buffer_count(&self) -> usize {
        self.registration.as_ref().map_or(0, |reg| reg.owners.len())
    }

    /// Number of buffers currently queued to the driver
    pub fn buffers_held_by_driver(&self) -> usize {
        self.registration.as_ref().map_or(0, |reg| {
            reg.owners
                .iter()
                .filter(|o| **o == BufferOwner::Driver)
                .count()
        })
    }

    /// Snapshot of a registered buffer
    pub fn buffer_info(&self, index: usize) -> Option<BufferInfo> {
        let reg = self.registration.as_ref()?;
        let desc = reg.pool.descriptor(index)?;
        let owner = reg.owners.get(index).copied()?;
        Some(BufferInfo {
            index,
            user_addr: desc.user_addr(),
            phys_addr: desc.phys_addr(),
            size: desc.size(),
            bytes_used: desc.bytes_used(),
            width: desc.width(),
            height: desc.height(),
            owner,
        })
    }
}

impl<D: CaptureDevice> fmt::Debug for CaptureSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("state", &self.state())
            .field("buffers", &self.buffer_count())
            .field("held_by_driver", &self.buffers_held_by_driver())
            .field("dequeue_timeout", &self.dequeue_timeout)
            .finish()
    }
}

impl<D: CaptureDevice> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        let Some(registration) = self.registration.take() else {
            return;
        };

        if self.streaming {
            if let Err(e) = self.device.stream_off() {
                warn!("VIDIOC_STREAMOFF failed during teardown: {}", e);
            }
            self.streaming = false;
        }

        match self.device.request_buffers(0) {
            Ok(_) => debug!("Released {} buffers on drop", registration.pool.len()),
            Err(e) => {
                error!(
                    "Driver refused to release buffers on drop ({}); leaking {} buffers",
                    e,
                    registration.pool.len()
                );
                std::mem::forget(registration);
            }
        }
    }
}

/// Lazy enumeration of a device's inputs
///
/// Ends at the first index the driver does not know. A device error is
/// yielded once and ends the sequence.
pub struct Inputs<'a, D: CaptureDevice> {
    device: &'a D,
    next: u32,
    done: bool,
}

impl<D: CaptureDevice> Iterator for Inputs<'_, D> {
    type Item = Result<InputInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next >= MAX_INPUTS {
            return None;
        }

        match self.device.enum_input(self.next) {
            Ok(Some(info)) => {
                self.next += 1;
                Some(Ok(info))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(CaptureError::device("VIDIOC_ENUMINPUT", e)))
            }
        }
    }
}

impl<D: CaptureDevice> FusedIterator for Inputs<'_, D> {}
