//! Buffer Pool
//!
//! An ordered, fixed-size set of capture buffers. Index `i` of the pool is
//! the buffer the driver knows as index `i`.

use crate::error::{CaptureError, Result};
use crate::memory::allocator::{Allocator, DmaRegion};
use std::time::Duration;
use tracing::{debug, info};

/// One capture buffer and the metadata of its latest fill
#[derive(Debug)]
pub struct BufferDescriptor {
    index: usize,
    region: DmaRegion,
    bytes_used: usize,
    width: u32,
    height: u32,
    timestamp: Duration,
    sequence: u32,
}

impl BufferDescriptor {
    /// Driver-facing buffer index
    pub fn index(&self) -> usize {
        self.index
    }

    /// Userspace address of the backing memory
    pub fn user_addr(&self) -> usize {
        self.region.user_addr()
    }

    /// Device-visible address of the backing memory
    pub fn phys_addr(&self) -> u64 {
        self.region.phys_addr()
    }

    /// Capacity in bytes
    pub fn size(&self) -> usize {
        self.region.size()
    }

    /// Payload length of the latest fill (zero before the first one)
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Frame width recorded at registration
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height recorded at registration
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Capture timestamp of the latest fill
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Driver sequence number of the latest fill
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Valid payload of the latest fill
    pub fn data(&self) -> &[u8] {
        &self.region.as_slice()[..self.bytes_used]
    }

    /// Whole buffer, for callers that fill it themselves
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.region.as_mut_slice()
    }

    pub(crate) fn set_geometry(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    pub(crate) fn record_fill(&mut self, bytes_used: usize, timestamp: Duration, sequence: u32) {
        self.bytes_used = bytes_used.min(self.size());
        self.timestamp = timestamp;
        self.sequence = sequence;
    }
}

/// Fixed set of capture buffers, indices `0..len()`
///
/// The count never changes; build a new pool to resize. [`BufferPool::destroy`]
/// consumes the pool, so it cannot be used afterwards. A pool dropped
/// without `destroy` still returns its memory.
#[derive(Debug)]
pub struct BufferPool {
    descriptors: Vec<BufferDescriptor>,
    buffer_size: usize,
    allocator: Allocator,
}

impl BufferPool {
    /// Allocate `count` buffers of `buffer_size` bytes
    pub fn create(allocator: &Allocator, buffer_size: usize, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(CaptureError::invalid_argument("buffer pool needs at least one buffer"));
        }
        if count > u32::MAX as usize {
            return Err(CaptureError::invalid_argument(format!(
                "{} buffers exceed the driver index range",
                count
            )));
        }

        let regions = allocator.allocate(buffer_size, count)?;
        let descriptors = regions
            .into_iter()
            .enumerate()
            .map(|(index, region)| BufferDescriptor {
                index,
                region,
                bytes_used: 0,
                width: 0,
                height: 0,
                timestamp: Duration::ZERO,
                sequence: 0,
            })
            .collect();

        info!("Created buffer pool: {} x {} bytes", count, buffer_size);

        Ok(Self {
            descriptors,
            buffer_size,
            allocator: allocator.clone(),
        })
    }

    /// Return every buffer to the allocator
    pub fn destroy(self) -> Result<()> {
        debug!("Destroying buffer pool of {} buffers", self.descriptors.len());
        let regions = self.descriptors.into_iter().map(|d| d.region).collect();
        self.allocator.release(regions)
    }

    /// Number of buffers
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Always false, pools hold at least one buffer
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Capacity of each buffer in bytes
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Descriptor at `index`
    pub fn descriptor(&self, index: usize) -> Option<&BufferDescriptor> {
        self.descriptors.get(index)
    }

    /// Mutable descriptor at `index`
    pub fn descriptor_mut(&mut self, index: usize) -> Option<&mut BufferDescriptor> {
        self.descriptors.get_mut(index)
    }

    /// All descriptors in index order
    pub fn descriptors(&self) -> &[BufferDescriptor] {
        &self.descriptors
    }

    /// Iterate descriptors in index order
    pub fn iter(&self) -> impl Iterator<Item = &BufferDescriptor> {
        self.descriptors.iter()
    }

    pub(crate) fn descriptors_mut(&mut self) -> &mut [BufferDescriptor] {
        &mut self.descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::heap::HostHeap;

    #[test]
    fn test_pool_indices_contiguous() {
        let allocator = Allocator::new(HostHeap::new()).unwrap();
        let pool = BufferPool::create(&allocator, 65536, 4).unwrap();

        assert_eq!(pool.len(), 4);
        for (i, desc) in pool.iter().enumerate() {
            assert_eq!(desc.index(), i);
            assert_eq!(desc.size(), 65536);
            assert_eq!(desc.bytes_used(), 0);
            assert_ne!(desc.user_addr(), 0);
            assert_ne!(desc.phys_addr(), 0);
        }

        pool.destroy().unwrap();
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_pool_rejects_empty() {
        let allocator = Allocator::new(HostHeap::new()).unwrap();
        assert!(matches!(
            BufferPool::create(&allocator, 4096, 0),
            Err(CaptureError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_pool_drop_releases_memory() {
        let allocator = Allocator::new(HostHeap::new()).unwrap();
        {
            let _pool = BufferPool::create(&allocator, 1024, 3).unwrap();
            assert_eq!(allocator.outstanding(), 3);
        }
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_record_fill_clamps_to_capacity() {
        let allocator = Allocator::new(HostHeap::new()).unwrap();
        let mut pool = BufferPool::create(&allocator, 128, 1).unwrap();
        let desc = pool.descriptor_mut(0).unwrap();

        desc.record_fill(4096, Duration::from_micros(10), 7);
        assert_eq!(desc.bytes_used(), 128);
        assert_eq!(desc.sequence(), 7);
        assert_eq!(desc.data().len(), 128);
    }
}
