//! Capture Memory Module
//!
//! Physically backed buffers for user-pointer capture.
//!
//! ## Architecture
//!
//! ```text
//! DmaHeap (host / cmem) → Allocator → DmaRegion × N → BufferPool → CaptureSession
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use capture_dma_core::memory::{Allocator, BufferPool, HostHeap};
//!
//! let allocator = Allocator::new(HostHeap::new()).unwrap();
//! let pool = BufferPool::create(&allocator, 640 * 480 * 2, 4).unwrap();
//! assert_eq!(pool.len(), 4);
//! pool.destroy().unwrap();
//! ```

mod allocator;
#[cfg(feature = "cmem")]
mod cmem;
mod heap;
mod pool;

pub use allocator::{Allocator, DmaRegion};
#[cfg(feature = "cmem")]
pub use cmem::{CmemHeap, CmemSource};
pub use heap::{AllocParams, CachePolicy, DmaHeap, HeapBlock, HostHeap, DMA_ALIGNMENT};
pub use pool::{BufferDescriptor, BufferPool};
