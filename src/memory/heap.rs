//! Physical Memory Heaps
//!
//! A [`DmaHeap`] is the process-wide source of capture memory. It hands out
//! blocks that have both a userspace address and a device-visible address.
//!
//! Two heaps ship with the crate:
//!
//! - [`HostHeap`]: portable, backed by the global allocator. The device
//!   address equals the user address, which is what a user-pointer capture
//!   driver behind an IOMMU (or the simulated driver) expects.
//! - `CmemHeap` (feature `cmem`): TI's contiguous memory allocator.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Alignment required by the capture DMA engine
pub const DMA_ALIGNMENT: usize = 32;

/// CPU cache policy for an allocated block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// CPU writes reach memory immediately, no flush needed before DMA
    #[default]
    NonCached,
    /// Cached mapping, caller is responsible for cache maintenance
    Cached,
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CachePolicy::NonCached => write!(f, "non-cached"),
            CachePolicy::Cached => write!(f, "cached"),
        }
    }
}

/// Parameters passed to every heap allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocParams {
    /// Required alignment in bytes (power of two)
    pub alignment: usize,
    /// Cache policy for the mapping
    pub cache: CachePolicy,
}

impl Default for AllocParams {
    fn default() -> Self {
        Self {
            alignment: DMA_ALIGNMENT,
            cache: CachePolicy::NonCached,
        }
    }
}

/// A block returned by a heap
#[derive(Debug, Clone, Copy)]
pub struct HeapBlock {
    /// Userspace address of the block
    pub user: NonNull<u8>,
    /// Device-visible address, zero if the heap could not resolve one
    pub phys: u64,
}

/// Allocator boundary
///
/// `init` is called exactly once before the first `alloc` and `exit` exactly
/// once after the last `free`. The [`Allocator`](super::Allocator) enforces
/// that bracket; heaps only implement the raw operations.
pub trait DmaHeap: Send {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Initialize the heap subsystem
    fn init(&mut self) -> io::Result<()>;

    /// Tear down the heap subsystem
    fn exit(&mut self) -> io::Result<()>;

    /// Allocate `size` bytes
    fn alloc(&mut self, size: usize, params: &AllocParams) -> io::Result<HeapBlock>;

    /// Return a block previously obtained from `alloc`
    fn free(&mut self, user: NonNull<u8>, size: usize, params: &AllocParams) -> io::Result<()>;
}

/// Heap backed by the process allocator
///
/// Optional capacity limit makes exhaustion reproducible. The cache policy is
/// recorded but has no effect on ordinary host memory.
pub struct HostHeap {
    capacity: Option<usize>,
    in_use: usize,
    live: HashMap<usize, Layout>,
}

impl HostHeap {
    /// Heap without a capacity limit
    pub fn new() -> Self {
        Self {
            capacity: None,
            in_use: 0,
            live: HashMap::new(),
        }
    }

    /// Heap that refuses allocations beyond `bytes` in total
    pub fn with_capacity(bytes: usize) -> Self {
        let mut heap = Self::new();
        heap.capacity = Some(bytes);
        heap
    }

    /// Bytes currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Configured capacity, if any
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl Default for HostHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaHeap for HostHeap {
    fn name(&self) -> &str {
        "host"
    }

    fn init(&mut self) -> io::Result<()> {
        debug!("Host heap initialized (capacity: {:?})", self.capacity);
        Ok(())
    }

    fn exit(&mut self) -> io::Result<()> {
        if !self.live.is_empty() {
            warn!("Host heap exiting with {} live blocks", self.live.len());
        }
        Ok(())
    }

    fn alloc(&mut self, size: usize, params: &AllocParams) -> io::Result<HeapBlock> {
        if let Some(capacity) = self.capacity {
            if self.in_use + size > capacity {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    format!(
                        "host heap exhausted: {} of {} bytes in use, {} requested",
                        self.in_use, capacity, size
                    ),
                ));
            }
        }

        let layout = Layout::from_size_align(size, params.alignment)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        if layout.size() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-sized allocation",
            ));
        }

        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let user = NonNull::new(ptr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "allocation failed"))?;

        self.live.insert(user.as_ptr() as usize, layout);
        self.in_use += size;

        Ok(HeapBlock {
            user,
            phys: user.as_ptr() as u64,
        })
    }

    fn free(&mut self, user: NonNull<u8>, _size: usize, _params: &AllocParams) -> io::Result<()> {
        let layout = self.live.remove(&(user.as_ptr() as usize)).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:p} was not allocated by this heap", user),
            )
        })?;

        // SAFETY: the pointer came from alloc_zeroed with this exact layout
        // and has just been removed from the live set, so it is freed once.
        unsafe { alloc::dealloc(user.as_ptr(), layout) };
        self.in_use -= layout.size();
        Ok(())
    }
}

impl Drop for HostHeap {
    fn drop(&mut self) {
        for (addr, layout) in self.live.drain() {
            // SAFETY: every live entry is an outstanding alloc_zeroed block.
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}
