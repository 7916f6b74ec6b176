//! Physical Buffer Allocator
//!
//! Wraps a [`DmaHeap`] with the init/exit bracket and batch semantics the
//! capture path relies on:
//!
//! - a batch either succeeds completely or leaves nothing allocated
//! - release is best-effort and reports an aggregated failure
//! - every [`DmaRegion`] is returned to the heap exactly once, either through
//!   an explicit release or when it is dropped
//!
//! ## Example
//!
//! ```rust
//! use capture_dma_core::memory::{Allocator, HostHeap};
//!
//! let allocator = Allocator::new(HostHeap::new()).unwrap();
//! let regions = allocator.allocate(65536, 4).unwrap();
//! assert_eq!(allocator.outstanding(), 4);
//!
//! allocator.release(regions).unwrap();
//! allocator.shutdown().unwrap();
//! ```

use crate::error::{CaptureError, Result};
use crate::memory::heap::{AllocParams, DmaHeap, HeapBlock};
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Heap plus bookkeeping, shared by the allocator handle and its regions
struct AllocatorInner {
    heap: Box<dyn DmaHeap>,
    params: AllocParams,
    initialized: bool,
    outstanding: usize,
}

impl AllocatorInner {
    /// Allocate one block, rejecting blocks without a device address
    fn alloc_block(&mut self, size: usize) -> Result<HeapBlock> {
        let params = self.params;
        let block = self
            .heap
            .alloc(size, &params)
            .map_err(|e| CaptureError::allocation(format!("{} heap: {}", self.heap.name(), e)))?;

        if block.phys == 0 {
            if let Err(e) = self.heap.free(block.user, size, &params) {
                warn!("Failed to return block without physical address: {}", e);
            }
            return Err(CaptureError::allocation(format!(
                "{} heap returned a block without physical address",
                self.heap.name()
            )));
        }

        Ok(block)
    }

    fn free_block(&mut self, user: NonNull<u8>, size: usize) -> Result<()> {
        let params = self.params;
        self.heap
            .free(user, size, &params)
            .map_err(|e| CaptureError::allocation(format!("free of {:p} failed: {}", user, e)))?;
        // A block the heap refused stays counted, keeping shutdown refused
        self.outstanding = self.outstanding.saturating_sub(1);
        Ok(())
    }
}

impl Drop for AllocatorInner {
    fn drop(&mut self) {
        if self.initialized {
            debug!("Last allocator handle dropped, exiting {} heap", self.heap.name());
            if let Err(e) = self.heap.exit() {
                warn!("Heap exit failed: {}", e);
            }
        }
    }
}

fn lock(inner: &Mutex<AllocatorInner>) -> MutexGuard<'_, AllocatorInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the process-wide capture memory allocator
///
/// Cloning the handle is cheap; all clones share one heap. The heap is
/// initialized by [`Allocator::new`] and torn down by [`Allocator::shutdown`]
/// (or when the last handle and the last region are gone).
#[derive(Clone)]
pub struct Allocator {
    inner: Arc<Mutex<AllocatorInner>>,
}

impl Allocator {
    /// Initialize `heap` with the default capture parameters
    /// (32-byte alignment, non-cached)
    pub fn new(heap: impl DmaHeap + 'static) -> Result<Self> {
        Self::with_params(heap, AllocParams::default())
    }

    /// Initialize `heap` with explicit allocation parameters
    pub fn with_params(mut heap: impl DmaHeap + 'static, params: AllocParams) -> Result<Self> {
        if !params.alignment.is_power_of_two() {
            return Err(CaptureError::invalid_argument(format!(
                "alignment {} is not a power of two",
                params.alignment
            )));
        }

        heap.init()
            .map_err(|e| CaptureError::allocation(format!("{} heap init failed: {}", heap.name(), e)))?;

        info!(
            "Allocator ready: {} heap, alignment={}, {}",
            heap.name(),
            params.alignment,
            params.cache
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(AllocatorInner {
                heap: Box::new(heap),
                params,
                initialized: true,
                outstanding: 0,
            })),
        })
    }

    /// Reserve `count` regions of `size` bytes each
    ///
    /// All-or-nothing: if any region fails, the regions already obtained in
    /// this call go back to the heap before the error is returned.
    pub fn allocate(&self, size: usize, count: usize) -> Result<Vec<DmaRegion>> {
        if size == 0 || count == 0 {
            return Err(CaptureError::invalid_argument(format!(
                "cannot allocate {} regions of {} bytes",
                count, size
            )));
        }

        let mut inner = lock(&self.inner);
        if !inner.initialized {
            return Err(CaptureError::NotInitialized);
        }

        debug!("Allocating {} regions of {} bytes", count, size);

        let mut blocks = Vec::with_capacity(count);
        for i in 0..count {
            match inner.alloc_block(size) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    warn!(
                        "Allocation of region {} of {} failed, rolling back {} regions",
                        i,
                        count,
                        blocks.len()
                    );
                    let params = inner.params;
                    for block in blocks.drain(..) {
                        if let Err(free_err) = inner.heap.free(block.user, size, &params) {
                            warn!("Rollback free of {:p} failed: {}", block.user, free_err);
                        }
                    }
                    return Err(e);
                }
            }
        }
        inner.outstanding += count;
        drop(inner);

        Ok(blocks
            .into_iter()
            .map(|block| DmaRegion {
                user: Some(block.user),
                phys: block.phys,
                size,
                owner: Arc::clone(&self.inner),
            })
            .collect())
    }

    /// Reserve a single region, e.g. a scratch buffer for an encoder
    pub fn allocate_one(&self, size: usize) -> Result<DmaRegion> {
        let mut regions = self.allocate(size, 1)?;
        regions
            .pop()
            .ok_or_else(|| CaptureError::allocation("empty allocation batch"))
    }

    /// Return every region to the heap
    ///
    /// Continues past individual failures; the error reports how many
    /// regions could not be freed.
    pub fn release(&self, regions: Vec<DmaRegion>) -> Result<()> {
        let total = regions.len();
        let mut failures = 0;

        for region in regions {
            if let Err(e) = region.release() {
                warn!("{}", e);
                failures += 1;
            }
        }

        debug!("Released {} regions ({} failures)", total, failures);

        if failures > 0 {
            Err(CaptureError::ReleaseFailed { failures, total })
        } else {
            Ok(())
        }
    }

    /// Tear down the heap
    ///
    /// Refused while regions are outstanding. Afterwards every allocation
    /// fails with [`CaptureError::NotInitialized`].
    pub fn shutdown(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if !inner.initialized {
            return Err(CaptureError::NotInitialized);
        }
        if inner.outstanding > 0 {
            return Err(CaptureError::AllocatorBusy(inner.outstanding));
        }

        inner.initialized = false;
        let name = inner.heap.name().to_string();
        inner
            .heap
            .exit()
            .map_err(|e| CaptureError::allocation(format!("{} heap exit failed: {}", name, e)))?;

        info!("Allocator shut down ({} heap)", name);
        Ok(())
    }

    /// Whether the heap is between init and exit
    pub fn is_initialized(&self) -> bool {
        lock(&self.inner).initialized
    }

    /// Number of regions the heap still holds
    ///
    /// Regions whose free the heap refused are included.
    pub fn outstanding(&self) -> usize {
        lock(&self.inner).outstanding
    }

    /// Allocation parameters in effect
    pub fn params(&self) -> AllocParams {
        lock(&self.inner).params
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("Allocator")
            .field("heap", &inner.heap.name())
            .field("initialized", &inner.initialized)
            .field("outstanding", &inner.outstanding)
            .finish()
    }
}

/// One allocated block: user address, device address and size as a unit
///
/// Released exactly once: by [`DmaRegion::release`], by
/// [`Allocator::release`], or on drop.
pub struct DmaRegion {
    user: Option<NonNull<u8>>,
    phys: u64,
    size: usize,
    owner: Arc<Mutex<AllocatorInner>>,
}

// SAFETY: the region exclusively owns its block; the pointer is only
// dereferenced through &self/&mut self borrows of the region.
unsafe impl Send for DmaRegion {}
// SAFETY: shared access only hands out &[u8]; no interior mutability.
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Userspace address of the block
    pub fn user_addr(&self) -> usize {
        self.user.map_or(0, |p| p.as_ptr() as usize)
    }

    /// Device-visible address of the block
    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    /// Capacity in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Raw pointer for handing the block to a driver
    pub fn as_ptr(&self) -> *mut u8 {
        self.user.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    /// Contents of the block
    pub fn as_slice(&self) -> &[u8] {
        match self.user {
            // SAFETY: the block is `size` bytes, live while the region is,
            // and zero-initialized or written by its owner.
            Some(p) => unsafe { std::slice::from_raw_parts(p.as_ptr(), self.size) },
            None => &[],
        }
    }

    /// Mutable contents of the block
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.user {
            // SAFETY: as for as_slice; &mut self guarantees exclusivity.
            Some(p) => unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), self.size) },
            None => &mut [],
        }
    }

    /// Return the block to the heap now
    pub fn release(mut self) -> Result<()> {
        match self.user.take() {
            Some(user) => lock(&self.owner).free_block(user, self.size),
            None => Ok(()),
        }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        if let Some(user) = self.user.take() {
            if let Err(e) = lock(&self.owner).free_block(user, self.size) {
                warn!("Dropped region could not be freed: {}", e);
            }
        }
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("user", &format_args!("{:#x}", self.user_addr()))
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::heap::HostHeap;
    use std::io;

    /// Heap that fails the n-th allocation and counts exits
    struct FlakyHeap {
        host: HostHeap,
        fail_at: Option<usize>,
        allocs: usize,
        zero_phys: bool,
    }

    impl FlakyHeap {
        fn failing_at(n: usize) -> Self {
            Self {
                host: HostHeap::new(),
                fail_at: Some(n),
                allocs: 0,
                zero_phys: false,
            }
        }
    }

    impl DmaHeap for FlakyHeap {
        fn name(&self) -> &str {
            "flaky"
        }

        fn init(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn exit(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn alloc(&mut self, size: usize, params: &AllocParams) -> io::Result<HeapBlock> {
            let n = self.allocs;
            self.allocs += 1;
            if Some(n) == self.fail_at {
                return Err(io::Error::new(io::ErrorKind::OutOfMemory, "injected"));
            }
            let mut block = self.host.alloc(size, params)?;
            if self.zero_phys {
                block.phys = 0;
            }
            Ok(block)
        }

        fn free(&mut self, user: NonNull<u8>, size: usize, params: &AllocParams) -> io::Result<()> {
            self.host.free(user, size, params)
        }
    }

    #[test]
    fn test_allocate_and_release() {
        let allocator = Allocator::new(HostHeap::new()).unwrap();
        let regions = allocator.allocate(4096, 3).unwrap();

        assert_eq!(regions.len(), 3);
        for region in &regions {
            assert_eq!(region.size(), 4096);
            assert_eq!(region.user_addr() % 32, 0);
            assert_ne!(region.phys_addr(), 0);
        }
        assert_eq!(allocator.outstanding(), 3);

        allocator.release(regions).unwrap();
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_partial_failure_rolls_back() {
        let allocator = Allocator::new(FlakyHeap::failing_at(2)).unwrap();
        let err = allocator.allocate(1024, 4).unwrap_err();

        assert!(matches!(err, CaptureError::Allocation(_)));
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_zero_physical_address_is_failure() {
        let heap = FlakyHeap {
            zero_phys: true,
            ..FlakyHeap::failing_at(usize::MAX)
        };
        let allocator = Allocator::new(heap).unwrap();

        assert!(matches!(
            allocator.allocate(1024, 1),
            Err(CaptureError::Allocation(_))
        ));
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_drop_releases_region() {
        let allocator = Allocator::new(HostHeap::new()).unwrap();
        {
            let _region = allocator.allocate_one(512).unwrap();
            assert_eq!(allocator.outstanding(), 1);
        }
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_shutdown_discipline() {
        let allocator = Allocator::new(HostHeap::new()).unwrap();
        let region = allocator.allocate_one(512).unwrap();

        assert!(matches!(
            allocator.shutdown(),
            Err(CaptureError::AllocatorBusy(1))
        ));

        region.release().unwrap();
        allocator.shutdown().unwrap();
        assert!(!allocator.is_initialized());

        assert!(matches!(
            allocator.allocate(512, 1),
            Err(CaptureError::NotInitialized)
        ));
        assert!(matches!(allocator.shutdown(), Err(CaptureError::NotInitialized)));
    }

    #[test]
    fn test_invalid_arguments() {
        let allocator = Allocator::new(HostHeap::new()).unwrap();
        assert!(matches!(
            allocator.allocate(0, 1),
            Err(CaptureError::InvalidArgument(_))
        ));
        assert!(matches!(
            allocator.allocate(16, 0),
            Err(CaptureError::InvalidArgument(_))
        ));

        let params = AllocParams {
            alignment: 24,
            ..Default::default()
        };
        assert!(Allocator::with_params(HostHeap::new(), params).is_err());
    }

    #[test]
    fn test_region_contents_writable() {
        let allocator = Allocator::new(HostHeap::new()).unwrap();
        let mut region = allocator.allocate_one(64).unwrap();

        assert!(region.as_slice().iter().all(|&b| b == 0));
        region.as_mut_slice()[..4].copy_from_slice(b"UYVY");
        assert_eq!(&region.as_slice()[..4], b"UYVY");
    }
}
