//! Video Capture Module
//!
//! User-pointer video capture over DMA buffers.
//!
//! ## Architecture
//!
//! ```text
//! BufferPool → CaptureSession ⇄ CaptureDevice (V4L2 driver / simulated)
//!                   ↓
//!          dequeue → FrameView → enqueue
//!                   ↓
//!          FrameTimingTracker
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use capture_dma_core::config::CaptureConfig;
//! use capture_dma_core::memory::{Allocator, BufferPool, HostHeap};
//! use capture_dma_core::video::{CaptureSession, V4l2CaptureDevice};
//!
//! let config = CaptureConfig::vga();
//! let device = V4l2CaptureDevice::open(&config.device_path)?;
//! let mut session = CaptureSession::with_timeout(device, config.dequeue_timeout());
//!
//! let pitch = session.query_line_pitch()?;
//! let allocator = Allocator::new(HostHeap::new())?;
//! let pool = BufferPool::create(&allocator, config.buffer_size_for_pitch(pitch), config.buffer_count)?;
//!
//! session.register_buffers(pool, config.width, config.height)?;
//! session.start_streaming()?;
//! let buffer = session.dequeue()?;
//! session.enqueue(buffer.index)?;
//! ```
//!
//! ## Requirements
//!
//! - Linux kernel with V4L2 support
//! - A capture driver supporting `V4L2_MEMORY_USERPTR` (VPFE/CCDC, uvcvideo, vivid):
//!   ```bash
//!   sudo modprobe vivid
//!   ```

mod capture_daemon;
mod device;
mod frame;
mod session;
mod simulated;
mod timing;
#[cfg(target_os = "linux")]
mod v4l2_device;

pub use capture_daemon::{CaptureDaemon, CaptureDaemonConfig, DaemonStats};
pub use device::{CaptureDevice, CaptureFormat, InputInfo, InputType, RawBuffer};
pub use frame::{align_up, CapturedFrame, FrameView, PixelFormat};
pub use session::{
    BufferInfo, BufferOwner, CaptureSession, DequeuedBuffer, Inputs, RegisterError, SessionState,
    DEFAULT_DEQUEUE_TIMEOUT,
};
pub use simulated::{DeviceOp, FaultInjector, SimulatedDevice};
pub use timing::{FrameTimingStats, FrameTimingTracker};
#[cfg(target_os = "linux")]
pub use v4l2_device::{find_capture_devices, V4l2CaptureDevice};
