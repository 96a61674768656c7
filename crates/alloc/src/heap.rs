// SPDX-License-Identifier: Apache-2.0

//! Per-worker heap: NUMA-partitioned block lists plus lazy reintegration of
//! regions freed by other workers.

use crate::block::AllocatedBlock;
use crate::header::{ALLOCATION_HEADER_SIZE, AllocationHeader, FreeHeader};
use crate::next_multiple;
use std::collections::HashMap;
use std::ptr::NonNull;
use taskmill_config::{MAX_NUMA_NODES, NumaNodeId, WorkerId};
use taskmill_queue::MpscQueue;

/// The heap of one worker.
///
/// All methods taking `&mut self` are owner-only: exactly one thread — the
/// owning worker — calls them. Other workers interact with this heap solely
/// through the remote-free queues passed into [`WorkerHeap::allocate`] and
/// the refund methods.
pub struct WorkerHeap {
    worker_id: WorkerId,
    numa_node_id: NumaNodeId,
    block_size: usize,
    next_block_id: u32,
    /// Block lists, one per NUMA node the worker allocates on.
    blocks: Vec<Vec<AllocatedBlock>>,
    /// Per node: block id to position in the block list.
    block_index: Vec<HashMap<u32, usize>>,
}

impl WorkerHeap {
    /// Creates an empty heap for `worker_id`, whose CPU lives on
    /// `numa_node_id`.
    #[must_use]
    pub fn new(worker_id: WorkerId, numa_node_id: NumaNodeId, block_size: usize) -> Self {
        Self {
            worker_id,
            numa_node_id,
            block_size,
            next_block_id: 0,
            blocks: (0..MAX_NUMA_NODES).map(|_| Vec::new()).collect(),
            block_index: (0..MAX_NUMA_NODES).map(|_| HashMap::new()).collect(),
        }
    }

    /// NUMA node of the owning worker.
    #[must_use]
    pub fn numa_node_id(&self) -> NumaNodeId {
        self.numa_node_id
    }

    /// Pre-maps one block per NUMA node so the first allocations do not pay
    /// for mapping. The worker's own node receives a larger head start.
    pub fn initialize(&mut self, count_numa_nodes: usize) {
        for numa_node_id in 0..count_numa_nodes as u8 {
            if !self.blocks[usize::from(numa_node_id)].is_empty() {
                continue;
            }
            let factor = if numa_node_id == self.numa_node_id { 4 } else { 1 };
            if self.map_new_block(numa_node_id, self.block_size * factor).is_none() {
                tracing::warn!(
                    worker_id = self.worker_id,
                    numa_node_id,
                    "failed to pre-map heap block"
                );
            }
        }
    }

    /// Allocates `size` bytes aligned to `alignment` on `numa_node_id`.
    ///
    /// Falls back to draining the remote-free queue for the node and, as a
    /// last resort, maps a new block. Returns `None` on OS-level OOM.
    pub fn allocate(
        &mut self,
        numa_node_id: NumaNodeId,
        alignment: usize,
        size: usize,
        remote_free: &[MpscQueue<FreeHeader>],
    ) -> Option<NonNull<u8>> {
        if size > u32::MAX as usize {
            return None;
        }

        // (1) Scan this node's blocks, newest first.
        if let Some(user) = self.allocate_from_blocks(numa_node_id, alignment, size) {
            return Some(user);
        }

        // (2) Fold regions freed by other workers back in, then retry.
        // Safety: this heap's owner is the single consumer of its queues.
        let mut refunded = false;
        for free_header in unsafe { remote_free[usize::from(numa_node_id)].drain() } {
            // Safety: drained headers describe regions of our own blocks.
            unsafe { self.refund(free_header) };
            refunded = true;
        }
        if refunded {
            if let Some(user) = self.allocate_from_blocks(numa_node_id, alignment, size) {
                return Some(user);
            }
        }

        // (3) Map a new block.
        let block_size = self
            .block_size
            .max(next_multiple(size + ALLOCATION_HEADER_SIZE + alignment, 64));
        let index = self.map_new_block(numa_node_id, block_size)?;
        self.blocks[usize::from(numa_node_id)][index].allocate(self.worker_id, alignment, size)
    }

    fn allocate_from_blocks(
        &mut self,
        numa_node_id: NumaNodeId,
        alignment: usize,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let blocks = &mut self.blocks[usize::from(numa_node_id)];
        for block in blocks.iter_mut().rev() {
            if let Some(user) = block.allocate(self.worker_id, alignment, size) {
                return Some(user);
            }
        }
        None
    }

    fn map_new_block(&mut self, numa_node_id: NumaNodeId, block_size: usize) -> Option<usize> {
        let id = self.next_block_id;
        match AllocatedBlock::map(id, numa_node_id, block_size) {
            Ok(block) => {
                self.next_block_id += 1;
                let list = &mut self.blocks[usize::from(numa_node_id)];
                list.push(block);
                let index = list.len() - 1;
                let _ = self.block_index[usize::from(numa_node_id)].insert(id, index);
                tracing::debug!(
                    worker_id = self.worker_id,
                    numa_node_id,
                    block_id = id,
                    block_size,
                    "mapped heap block"
                );
                Some(index)
            }
            Err(error) => {
                tracing::error!(
                    worker_id = self.worker_id,
                    numa_node_id,
                    block_size,
                    %error,
                    "failed to map heap block"
                );
                None
            }
        }
    }

    /// Frees an allocation of this heap on behalf of the owning worker.
    ///
    /// # Safety
    /// The header must describe a live allocation owned by this heap, the
    /// allocation must be dead, and the caller must be the owning worker.
    pub unsafe fn free_local(&mut self, header: &AllocationHeader) {
        debug_assert_eq!(header.worker_id(), self.worker_id);
        if let Some(block) = self.block_mut(header.numa_node_id(), header.block_id()) {
            // Safety: forwarded contract.
            unsafe { block.free(header) };
        }
    }

    /// Reintegrates a region announced by a free header.
    ///
    /// # Safety
    /// The header must describe a region of one of this heap's blocks, and
    /// the caller must be the owning worker holding the drained node.
    pub unsafe fn refund(&mut self, free_header: NonNull<FreeHeader>) {
        // Safety: header fields are readable while we own the node.
        let (numa_node_id, block_id) = unsafe {
            let header = free_header.as_ref();
            (header.numa_node_id(), header.block_id())
        };
        if let Some(block) = self.block_mut(numa_node_id, block_id) {
            // Safety: forwarded contract.
            unsafe { block.refund(free_header) };
        }
    }

    /// Drains every remote-free queue of this heap, the worker's own NUMA
    /// node first.
    ///
    /// # Safety
    /// The caller must be the owning worker (single consumer).
    pub unsafe fn refund_remote_freed(&mut self, remote_free: &[MpscQueue<FreeHeader>]) {
        let count = remote_free.len();
        for offset in 0..count {
            let node = (usize::from(self.numa_node_id) + offset) & (count - 1);
            // Safety: forwarded contract.
            for free_header in unsafe { remote_free[node].drain() } {
                unsafe { self.refund(free_header) };
            }
        }
    }

    /// Releases every block that is completely free, after folding in the
    /// remote-free queues.
    ///
    /// # Safety
    /// The caller must be the owning worker.
    pub unsafe fn release_free_memory(&mut self, remote_free: &[MpscQueue<FreeHeader>]) {
        // Safety: forwarded contract.
        unsafe { self.refund_remote_freed(remote_free) };

        for numa_node_id in 0..self.blocks.len() {
            let list = &mut self.blocks[numa_node_id];
            list.retain(|block| !block.is_free());
            let index = &mut self.block_index[numa_node_id];
            index.clear();
            for (position, block) in list.iter().enumerate() {
                let _ = index.insert(block.id(), position);
            }
        }
    }

    /// Releases every block unconditionally. Outstanding allocations become
    /// dangling, so this is reserved for teardown.
    pub fn release_all_memory(&mut self) {
        for list in &mut self.blocks {
            list.clear();
        }
        for index in &mut self.block_index {
            index.clear();
        }
    }

    /// True when every block of every node is completely free.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.blocks
            .iter()
            .all(|list| list.iter().all(AllocatedBlock::is_free))
    }

    /// Total number of free regions across all blocks of the given node.
    #[must_use]
    pub fn free_region_count(&self, numa_node_id: NumaNodeId) -> usize {
        self.blocks[usize::from(numa_node_id)]
            .iter()
            .map(AllocatedBlock::free_region_count)
            .sum()
    }

    /// Number of mapped blocks on the given node.
    #[must_use]
    pub fn block_count(&self, numa_node_id: NumaNodeId) -> usize {
        self.blocks[usize::from(numa_node_id)].len()
    }

    fn block_mut(
        &mut self,
        numa_node_id: NumaNodeId,
        block_id: u32,
    ) -> Option<&mut AllocatedBlock> {
        let position = *self.block_index[usize::from(numa_node_id)].get(&block_id)?;
        self.blocks[usize::from(numa_node_id)].get_mut(position)
    }
}
