// SPDX-License-Identifier: Apache-2.0

//! A block mapped from the OS into a worker-local heap.
//!
//! The owning worker carves allocations out of the block with a first-fit
//! scan over an address-ordered set of free regions and folds frees back by
//! coalescing with both neighbors. All of this is single-threaded by
//! construction — only the owning worker mutates a block.

use crate::error::Error;
use crate::header::{ALLOCATION_HEADER_SIZE, AllocationHeader, FreeHeader, MIN_REGION_SIZE};
use crate::os;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use taskmill_config::{NumaNodeId, WorkerId};

/// A split leaving a tail smaller than this is absorbed into the
/// allocation instead of producing a tiny free region.
pub const SPLIT_THRESHOLD: usize = 256;

/// One OS mapping, bound to a NUMA node, carved into allocations.
pub struct AllocatedBlock {
    id: u32,
    numa_node_id: NumaNodeId,
    size: usize,
    data: NonNull<u8>,
    /// Free regions by start address; the value is the region size. The
    /// in-memory [`FreeHeader`] at each start address mirrors the size.
    free: BTreeMap<usize, usize>,
}

// The raw data pointer is exclusively owned by the block; heaps move
// between threads only while no allocation is in flight.
unsafe impl Send for AllocatedBlock {}

impl AllocatedBlock {
    /// Maps a fresh block of `size` bytes bound to `numa_node_id`.
    pub fn map(id: u32, numa_node_id: NumaNodeId, size: usize) -> Result<Self, Error> {
        let data = os::map_block(numa_node_id, size)?;
        let mut free = BTreeMap::new();
        let _ = free.insert(data.as_ptr() as usize, size);
        // Safety: the mapping is at least MIN_REGION_SIZE bytes.
        unsafe {
            data.as_ptr()
                .cast::<FreeHeader>()
                .write(FreeHeader::new(size, numa_node_id, id));
        }
        Ok(Self {
            id,
            numa_node_id,
            size,
            data,
            free,
        })
    }

    /// Block id, unique within the owning heap.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Size of the whole mapping in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// NUMA node this block is bound to.
    #[must_use]
    pub fn numa_node_id(&self) -> NumaNodeId {
        self.numa_node_id
    }

    /// Base address of the mapping.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.data
    }

    /// True when the address lies inside this block.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.data.as_ptr() as usize;
        addr >= base && addr < base + self.size
    }

    /// True when the block consists of exactly one free region spanning the
    /// whole mapping.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.free.len() == 1
            && self
                .free
                .get(&(self.data.as_ptr() as usize))
                .is_some_and(|&region_size| region_size == self.size)
    }

    /// Number of free regions currently tracked.
    #[must_use]
    pub fn free_region_count(&self) -> usize {
        self.free.len()
    }

    /// Carves an allocation of `size` user bytes aligned to `alignment` out
    /// of the first free region (in address order) that fits.
    ///
    /// Returns the user address, or `None` when no region fits.
    pub fn allocate(
        &mut self,
        worker_id: WorkerId,
        alignment: usize,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let size = size.max(MIN_REGION_SIZE - ALLOCATION_HEADER_SIZE);
        let needed_min = size + ALLOCATION_HEADER_SIZE;

        let mut found = None;
        for (&region_start, &region_size) in &self.free {
            if region_size < needed_min {
                continue;
            }
            let user_addr = region_start + ALLOCATION_HEADER_SIZE;
            let pad = user_addr.next_multiple_of(alignment) - user_addr;
            let needed = needed_min + pad;
            if region_size >= needed {
                found = Some((region_start, region_size, pad, needed));
                break;
            }
        }

        let (region_start, region_size, pad, needed) = found?;
        let _ = self.free.remove(&region_start);

        let remaining = region_size - needed;
        let user_size = if remaining > SPLIT_THRESHOLD {
            let tail_start = region_start + needed;
            // Safety: the tail lies inside the block and is at least
            // SPLIT_THRESHOLD > MIN_REGION_SIZE bytes.
            unsafe {
                (tail_start as *mut FreeHeader)
                    .write(FreeHeader::new(remaining, self.numa_node_id, self.id));
            }
            let _ = self.free.insert(tail_start, remaining);
            size
        } else {
            // Absorb the tail into the allocation.
            region_size - ALLOCATION_HEADER_SIZE - pad
        };

        let header_addr = region_start + pad;
        // Safety: header and user bytes lie inside the removed free region.
        unsafe {
            (header_addr as *mut AllocationHeader).write(AllocationHeader::new(
                user_size as u32,
                pad as u16,
                worker_id,
                self.numa_node_id,
                self.id,
            ));
            Some(NonNull::new_unchecked(
                (header_addr + ALLOCATION_HEADER_SIZE) as *mut u8,
            ))
        }
    }

    /// Returns an allocation to the free set, coalescing with both
    /// neighbors.
    ///
    /// # Safety
    /// The header must describe a live allocation of this block, and the
    /// allocation must be dead (no outstanding references).
    pub unsafe fn free(&mut self, header: &AllocationHeader) {
        debug_assert_eq!(header.block_id(), self.id);
        self.refund_region(header.region_start(), header.region_size());
    }

    /// Reintegrates a region announced by a [`FreeHeader`], typically one
    /// drained from the remote-free queue.
    ///
    /// # Safety
    /// The header must describe a region of this block that is owned by the
    /// caller (drained from a queue or produced by a local free).
    pub unsafe fn refund(&mut self, free_header: NonNull<FreeHeader>) {
        // Safety: region start and size come from the header itself.
        let (start, size) = unsafe {
            let header = free_header.as_ref();
            debug_assert_eq!(header.block_id(), self.id);
            (free_header.as_ptr() as usize, header.size())
        };
        self.refund_region(start, size);
    }

    fn refund_region(&mut self, mut start: usize, mut size: usize) {
        debug_assert!(self.contains(start));
        debug_assert!(start + size <= self.data.as_ptr() as usize + self.size);

        // Coalesce with the right neighbor.
        if let Some((&next_start, &next_size)) = self.free.range(start + 1..).next() {
            if start + size == next_start {
                let _ = self.free.remove(&next_start);
                size += next_size;
            }
        }

        // Coalesce with the left neighbor.
        if let Some((&prev_start, &prev_size)) = self.free.range(..start).next_back() {
            if prev_start + prev_size == start {
                let _ = self.free.remove(&prev_start);
                size += prev_size;
                start = prev_start;
            }
        }

        // Safety: the merged region lies inside the block and holds at
        // least MIN_REGION_SIZE bytes.
        unsafe {
            (start as *mut FreeHeader).write(FreeHeader::new(size, self.numa_node_id, self.id));
        }
        let _ = self.free.insert(start, size);
    }
}

impl Drop for AllocatedBlock {
    fn drop(&mut self) {
        // Safety: the block owns its mapping exclusively.
        if let Err(error) = unsafe { os::unmap_block(self.data, self.size) } {
            tracing::warn!(block_id = self.id, %error, "failed to unmap block");
        }
    }
}
