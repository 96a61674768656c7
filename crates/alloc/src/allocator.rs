// SPDX-License-Identifier: Apache-2.0

//! The engine-wide allocator facade: one [`WorkerHeap`] per worker plus the
//! remote-free queues that connect them.
//!
//! # Threading contract
//! Methods marked `unsafe` with an *owner* contract must be called from the
//! thread that acts as the named worker; the runtime upholds this by
//! construction. Everything else — in particular the remote-free enqueue —
//! is safe from any thread.

use crate::header::{AllocationHeader, FreeHeader};
use crate::heap::WorkerHeap;
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use taskmill_config::{CoreSet, MAX_NUMA_NODES, NumaNodeId, WorkerId};
use taskmill_queue::MpscQueue;

struct HeapSlot {
    /// Owner-only heap state.
    heap: UnsafeCell<WorkerHeap>,
    /// Regions freed by other workers, one queue per caller NUMA node.
    remote_free: Box<[MpscQueue<FreeHeader>]>,
}

impl HeapSlot {
    fn new(worker_id: WorkerId, numa_node_id: NumaNodeId, block_size: usize) -> Self {
        Self {
            heap: UnsafeCell::new(WorkerHeap::new(worker_id, numa_node_id, block_size)),
            remote_free: (0..MAX_NUMA_NODES).map(|_| MpscQueue::new()).collect(),
        }
    }
}

/// All worker heaps of one engine instance.
pub struct Allocator {
    slots: Vec<HeapSlot>,
    numa_node_of_worker: Vec<NumaNodeId>,
    count_numa_nodes: usize,
    block_size: usize,
}

// Heap mutation is confined to the owning worker via the unsafe contracts;
// queue pushes are lock-free and thread-safe.
unsafe impl Send for Allocator {}
unsafe impl Sync for Allocator {}

impl Allocator {
    /// Creates one heap per core in the set.
    #[must_use]
    pub fn new(cores: &CoreSet, block_size: usize) -> Self {
        let numa_node_of_worker: Vec<NumaNodeId> = cores
            .iter()
            .map(|descriptor| descriptor.numa_node_id)
            .collect();
        let slots = numa_node_of_worker
            .iter()
            .enumerate()
            .map(|(worker_id, &numa_node_id)| {
                HeapSlot::new(worker_id as WorkerId, numa_node_id, block_size)
            })
            .collect();
        Self {
            slots,
            numa_node_of_worker,
            count_numa_nodes: cores.numa_node_count(),
            block_size,
        }
    }

    /// Number of worker heaps.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.slots.len()
    }

    /// NUMA node of the given worker's CPU.
    #[must_use]
    pub fn numa_node_of(&self, worker_id: WorkerId) -> NumaNodeId {
        self.numa_node_of_worker[usize::from(worker_id)]
    }

    /// Pre-maps the blocks of one worker's heap.
    ///
    /// # Safety
    /// Owner contract: must be called from the thread acting as
    /// `worker_id`, before any concurrent use of that heap.
    pub unsafe fn initialize_worker_heap(&self, worker_id: WorkerId) {
        // Safety: owner contract grants exclusive heap access.
        let heap = unsafe { &mut *self.slots[usize::from(worker_id)].heap.get() };
        heap.initialize(self.count_numa_nodes);
    }

    /// Allocates `size` bytes aligned to `alignment` from `worker_id`'s
    /// heap, bound to `numa_node_id`. Returns `None` on OOM.
    ///
    /// # Safety
    /// Owner contract: must be called from the thread acting as
    /// `worker_id`.
    pub unsafe fn allocate(
        &self,
        worker_id: WorkerId,
        numa_node_id: NumaNodeId,
        alignment: usize,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let slot = &self.slots[usize::from(worker_id)];
        // Safety: owner contract grants exclusive heap access.
        let heap = unsafe { &mut *slot.heap.get() };
        heap.allocate(numa_node_id, alignment, size, &slot.remote_free)
    }

    /// Frees an allocation on behalf of `calling_worker_id`.
    ///
    /// A local free is folded into the owning block immediately; a free of
    /// another worker's allocation is pushed onto that heap's remote-free
    /// queue and reintegrated lazily.
    ///
    /// # Safety
    /// `user` must be a live allocation of this allocator; the caller must
    /// be the thread acting as `calling_worker_id` and must not touch the
    /// allocation afterwards.
    pub unsafe fn free(&self, calling_worker_id: WorkerId, user: NonNull<u8>) {
        // Safety: user is a live allocation, so its header precedes it.
        let header = unsafe { AllocationHeader::from_user_ptr(user) };
        let owner = unsafe { header.as_ref() }.worker_id();

        if owner == calling_worker_id {
            // Safety: owner contract — we are the owning worker.
            let heap = unsafe { &mut *self.slots[usize::from(owner)].heap.get() };
            unsafe { heap.free_local(header.as_ref()) };
        } else {
            let calling_node = self.numa_node_of(calling_worker_id);
            // Safety: the allocation is dead per the contract; the region
            // becomes the queue node.
            unsafe {
                let free_header = header.as_ref().into_free_header();
                self.slots[usize::from(owner)].remote_free[usize::from(calling_node)]
                    .push(free_header);
            }
        }
    }

    /// Frees an allocation from a thread that is not a worker. Always takes
    /// the remote path, keyed to the owning worker's own node.
    ///
    /// # Safety
    /// `user` must be a live allocation of this allocator that the caller
    /// owns and never touches again.
    pub unsafe fn free_anywhere(&self, user: NonNull<u8>) {
        // Safety: forwarded contract.
        let header = unsafe { AllocationHeader::from_user_ptr(user) };
        let owner = unsafe { header.as_ref() }.worker_id();
        let node = self.numa_node_of(owner);
        unsafe {
            let free_header = header.as_ref().into_free_header();
            self.slots[usize::from(owner)].remote_free[usize::from(node)].push(free_header);
        }
    }

    /// Drains the remote-free queues of one heap and releases blocks that
    /// became completely free.
    ///
    /// # Safety
    /// Owner contract: must be called from the thread acting as
    /// `worker_id`.
    pub unsafe fn clean_up(&self, worker_id: WorkerId) {
        let slot = &self.slots[usize::from(worker_id)];
        // Safety: owner contract grants exclusive heap access.
        let heap = unsafe { &mut *slot.heap.get() };
        unsafe { heap.release_free_memory(&slot.remote_free) };
    }

    /// Drains the remote-free queues of one heap without releasing blocks.
    ///
    /// # Safety
    /// Owner contract: must be called from the thread acting as
    /// `worker_id`.
    pub unsafe fn refund_remote_freed(&self, worker_id: WorkerId) {
        let slot = &self.slots[usize::from(worker_id)];
        // Safety: owner contract grants exclusive heap access.
        let heap = unsafe { &mut *slot.heap.get() };
        unsafe { heap.refund_remote_freed(&slot.remote_free) };
    }

    /// Resets every heap between runs. With `force_free_memory` all blocks
    /// are dropped; otherwise only completely free ones. Grows the heap
    /// array when the new core set has more cores.
    pub fn reset(&mut self, cores: &CoreSet, force_free_memory: bool) {
        for slot in &mut self.slots {
            let heap = slot.heap.get_mut();
            if force_free_memory {
                heap.release_all_memory();
            } else {
                // Safety: &mut self grants exclusive access to all heaps.
                unsafe { heap.release_free_memory(&slot.remote_free) };
            }
        }

        self.numa_node_of_worker = cores
            .iter()
            .map(|descriptor| descriptor.numa_node_id)
            .collect();
        self.count_numa_nodes = cores.numa_node_count();

        for worker_id in self.slots.len()..cores.len() {
            self.slots.push(HeapSlot::new(
                worker_id as WorkerId,
                self.numa_node_of_worker[worker_id],
                self.block_size,
            ));
        }
    }

    /// True when every block of every heap is completely free.
    ///
    /// # Safety
    /// No allocation or free may run concurrently.
    #[must_use]
    pub unsafe fn is_free(&self) -> bool {
        self.slots.iter().all(|slot| {
            // Safety: quiescence contract.
            let heap = unsafe { &mut *slot.heap.get() };
            unsafe { heap.refund_remote_freed(&slot.remote_free) };
            heap.is_free()
        })
    }

    /// Number of free regions in one worker's heap for a node.
    ///
    /// # Safety
    /// No allocation or free may run concurrently on that heap.
    #[must_use]
    pub unsafe fn free_region_count(&self, worker_id: WorkerId, numa_node_id: NumaNodeId) -> usize {
        // Safety: quiescence contract.
        let heap = unsafe { &*self.slots[usize::from(worker_id)].heap.get() };
        heap.free_region_count(numa_node_id)
    }

    /// The worker and NUMA node recorded in an allocation's header.
    ///
    /// # Safety
    /// `user` must be a live allocation of this allocator.
    #[must_use]
    pub unsafe fn allocation_home(&self, user: NonNull<u8>) -> (WorkerId, NumaNodeId) {
        // Safety: forwarded contract.
        let header = unsafe { AllocationHeader::from_user_ptr(user) };
        let header = unsafe { header.as_ref() };
        (header.worker_id(), header.numa_node_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_core_set(workers: usize) -> CoreSet {
        CoreSet::from_pairs((0..workers as u16).map(|cpu| (cpu, 0)))
    }

    #[test]
    fn test_local_alloc_free_round_trip() {
        let allocator = Allocator::new(&small_core_set(1), 1 << 20);
        unsafe {
            allocator.initialize_worker_heap(0);
            let user = allocator.allocate(0, 0, 64, 4096).unwrap();
            assert_eq!(user.as_ptr() as usize % 64, 0);
            assert_eq!(allocator.allocation_home(user), (0, 0));
            allocator.free(0, user);
            assert!(allocator.is_free());
        }
    }

    #[test]
    fn test_cross_worker_free_travels_through_queue() {
        let allocator = Allocator::new(&small_core_set(2), 1 << 20);
        unsafe {
            allocator.initialize_worker_heap(0);
            let user = allocator.allocate(0, 0, 64, 4096).unwrap();
            // Worker 1 frees worker 0's allocation: lazy, not yet folded in.
            allocator.free(1, user);
            // The owner's clean-up pass reintegrates it.
            allocator.clean_up(0);
            assert!(allocator.is_free());
        }
    }

    #[test]
    fn test_reset_grows_heap_array() {
        let mut allocator = Allocator::new(&small_core_set(1), 1 << 20);
        assert_eq!(allocator.workers(), 1);
        allocator.reset(&small_core_set(3), false);
        assert_eq!(allocator.workers(), 3);
        unsafe {
            allocator.initialize_worker_heap(2);
            let user = allocator.allocate(2, 0, 64, 128).unwrap();
            allocator.free(2, user);
            assert!(allocator.is_free());
        }
    }
}
