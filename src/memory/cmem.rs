//! TI CMEM heap
//!
//! Physically contiguous memory from the `cmemk` kernel module through
//! `libcmem`. Enabled with the `cmem` feature; `build.rs` links the library
//! (override the search path with `CMEM_LIB_DIR`).

use crate::memory::heap::{AllocParams, CachePolicy, DmaHeap, HeapBlock};
use std::io;
use std::os::raw::{c_int, c_ulong, c_void};
use std::ptr::NonNull;
use tracing::{debug, info};

const CMEM_POOL: c_int = 0x0000;
const CMEM_HEAP: c_int = 0x0008;
const CMEM_NONCACHED: c_int = 0x0000;
const CMEM_CACHED: c_int = 0x0020;

#[repr(C)]
struct CmemAllocParams {
    alloc_type: c_int,
    flags: c_int,
    alignment: usize,
}

extern "C" {
    fn CMEM_init() -> c_int;
    fn CMEM_exit() -> c_int;
    fn CMEM_alloc(size: usize, params: *mut CmemAllocParams) -> *mut c_void;
    fn CMEM_getPhys(ptr: *mut c_void) -> c_ulong;
    fn CMEM_free(ptr: *mut c_void, params: *mut CmemAllocParams) -> c_int;
}

/// Where CMEM takes blocks from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CmemSource {
    /// The general CMEM heap, honours alignment
    #[default]
    Heap,
    /// Pre-sized CMEM pools
    Pool,
}

/// Heap backed by `libcmem`
#[derive(Debug, Default)]
pub struct CmemHeap {
    source: CmemSource,
}

impl CmemHeap {
    /// Allocate from the CMEM heap
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate from CMEM pools instead of the heap
    pub fn from_pools() -> Self {
        Self {
            source: CmemSource::Pool,
        }
    }

    fn raw_params(&self, params: &AllocParams) -> CmemAllocParams {
        CmemAllocParams {
            alloc_type: match self.source {
                CmemSource::Heap => CMEM_HEAP,
                CmemSource::Pool => CMEM_POOL,
            },
            flags: match params.cache {
                CachePolicy::NonCached => CMEM_NONCACHED,
                CachePolicy::Cached => CMEM_CACHED,
            },
            alignment: params.alignment,
        }
    }
}

impl DmaHeap for CmemHeap {
    fn name(&self) -> &str {
        "cmem"
    }

    fn init(&mut self) -> io::Result<()> {
        // SAFETY: plain library call, the Allocator calls it once.
        if unsafe { CMEM_init() } < 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "CMEM_init failed, is the cmemk module loaded?",
            ));
        }
        info!("CMEM initialized ({:?})", self.source);
        Ok(())
    }

    fn exit(&mut self) -> io::Result<()> {
        // SAFETY: called once, after every block has been freed.
        if unsafe { CMEM_exit() } < 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "CMEM_exit failed"));
        }
        Ok(())
    }

    fn alloc(&mut self, size: usize, params: &AllocParams) -> io::Result<HeapBlock> {
        let mut raw = self.raw_params(params);
        // SAFETY: raw outlives the call; CMEM returns NULL on failure.
        let ptr = unsafe { CMEM_alloc(size, &mut raw) };
        let user = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("CMEM_alloc of {} bytes failed", size),
            )
        })?;

        // SAFETY: user is a live CMEM block.
        let phys = unsafe { CMEM_getPhys(user.as_ptr().cast()) } as u64;
        debug!("CMEM block {:p} -> phys {:#x} ({} bytes)", user, phys, size);

        Ok(HeapBlock { user, phys })
    }

    fn free(&mut self, user: NonNull<u8>, _size: usize, params: &AllocParams) -> io::Result<()> {
        let mut raw = self.raw_params(params);
        // SAFETY: user came from CMEM_alloc with matching params.
        if unsafe { CMEM_free(user.as_ptr().cast(), &mut raw) } < 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("CMEM_free of {:p} failed", user),
            ));
        }
        Ok(())
    }
}
