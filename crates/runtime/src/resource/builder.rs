// SPDX-License-Identifier: Apache-2.0

//! Construction, scheduling and destruction of resources.
//!
//! The builder turns an annotation into a placement decision (home worker
//! and NUMA node) and a synchronization primitive, allocates the object
//! with its in-band header from the worker-local heap, and hands back the
//! tagged pointer. Destruction routes optimistic resources through the
//! epoch manager; everything else is freed immediately.

use crate::resource::annotation::{AccessFrequency, PlacementHint, ResourceAnnotation};
use crate::resource::header::{RESOURCE_HEADER_SIZE, ResourceHeader};
use crate::resource::ptr::ResourcePtr;
use crate::sync::primitive::{self, IsolationLevel, Primitive};
use crossbeam_utils::CachePadded;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use taskmill_alloc::{Allocator, CACHE_LINE_SIZE, EpochManager, GarbageNode};
use taskmill_config::{CoreSet, NumaNodeId, WorkerId};

/// A usage-prediction counter at or above this value marks a worker as
/// excessively loaded; round-robin placement of further exclusive
/// resources skips it.
const EXCESSIVE_USAGE: u64 = 100;

impl AccessFrequency {
    fn usage_weight(self) -> u64 {
        match self {
            AccessFrequency::Excessive => EXCESSIVE_USAGE,
            AccessFrequency::High => 10,
            AccessFrequency::Normal => 1,
            AccessFrequency::Unused => 0,
        }
    }
}

/// Builds, schedules and destroys resources.
pub struct Builder {
    /// Next worker for round-robin placement.
    round_robin: CachePadded<AtomicU16>,
    /// Per-worker usage prediction, fed by access-frequency hints.
    usage: Box<[CachePadded<AtomicU64>]>,
}

impl Builder {
    /// Creates a builder for `workers` workers.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            round_robin: CachePadded::new(AtomicU16::new(0)),
            usage: (0..workers)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
        }
    }

    /// Records the expected usage of a resource placed on `worker_id`.
    pub fn predict_usage(&self, worker_id: WorkerId, access_frequency: AccessFrequency) {
        let cell = &self.usage[usize::from(worker_id)];
        let weight = access_frequency.usage_weight();
        if weight > 0 {
            let _ = cell.fetch_add(weight, Ordering::Relaxed);
        }
    }

    /// True when a worker's predicted usage is saturated.
    #[must_use]
    pub fn has_excessive_usage(&self, worker_id: WorkerId) -> bool {
        self.usage[usize::from(worker_id)].load(Ordering::Relaxed) >= EXCESSIVE_USAGE
    }

    /// Chooses the home worker and allocation node for an annotation.
    ///
    /// Worker ids beyond the live worker count are remapped modulo the
    /// worker count rather than rejected.
    #[must_use]
    pub fn schedule(
        &self,
        annotation: &ResourceAnnotation,
        cores: &CoreSet,
    ) -> (WorkerId, NumaNodeId) {
        let count = cores.len() as u16;

        let worker_id = match annotation.placement() {
            PlacementHint::Worker(worker_id) => worker_id % count,
            PlacementHint::NumaNode(numa_node_id) => {
                // Round-robin among the workers of that node; any worker
                // when the node has none.
                let on_node: Vec<usize> = cores.workers_on_node(numa_node_id).collect();
                if on_node.is_empty() {
                    self.round_robin.fetch_add(1, Ordering::Relaxed) % count
                } else {
                    let slot = self.round_robin.fetch_add(1, Ordering::Relaxed);
                    on_node[usize::from(slot) % on_node.len()] as WorkerId
                }
            }
            PlacementHint::Any => {
                let mut worker_id = self.round_robin.fetch_add(1, Ordering::Relaxed) % count;
                // An exclusively scheduled resource would sit behind an
                // excessively used one forever; pick another worker once.
                if count > 2
                    && annotation.isolation_level() == IsolationLevel::Exclusive
                    && self.has_excessive_usage(worker_id)
                {
                    worker_id = self.round_robin.fetch_add(1, Ordering::Relaxed) % count;
                }
                worker_id
            }
        };

        self.predict_usage(worker_id, annotation.access_frequency());

        let numa_node_id = match annotation.placement() {
            PlacementHint::NumaNode(numa_node_id) => numa_node_id,
            _ => cores.numa_node_of(usize::from(worker_id)),
        };
        (worker_id, numa_node_id)
    }

    /// Builds a resource of type `T`, reserving at least `size` bytes for
    /// the object (which may exceed `size_of::<T>()` for types with a
    /// dynamically sized tail).
    ///
    /// Returns the null pointer on OOM.
    ///
    /// # Safety
    /// Owner contract: must run on the thread acting as `calling_worker`.
    /// For `size > size_of::<T>()` the tail bytes are zeroed padding the
    /// caller manages.
    pub unsafe fn build<T>(
        &self,
        calling_worker: WorkerId,
        size: usize,
        annotation: ResourceAnnotation,
        value: T,
        allocator: &Allocator,
        cores: &CoreSet,
    ) -> ResourcePtr {
        const {
            assert!(
                align_of::<T>() <= 64,
                "resource types must not exceed cache-line alignment"
            );
        }

        let chosen = primitive::select_primitive(&annotation);
        let (home_worker, numa_node_id) = self.schedule(&annotation, cores);

        let object_size = size.max(size_of::<T>());
        // Safety: owner contract forwarded.
        let Some(allocation) = (unsafe {
            allocator.allocate(
                calling_worker,
                numa_node_id,
                CACHE_LINE_SIZE,
                RESOURCE_HEADER_SIZE + object_size,
            )
        }) else {
            return ResourcePtr::null();
        };

        // Safety: the allocation is large enough for header and object and
        // is 64-byte aligned.
        unsafe {
            allocation.as_ptr().cast::<ResourceHeader>().write(ResourceHeader::new());
            let user = allocation.as_ptr().add(RESOURCE_HEADER_SIZE);
            user.cast::<T>().write(value);
            ResourcePtr::new(user, home_worker, chosen)
        }
    }

    /// Tags an existing object — one not owned by the worker heaps — with a
    /// home worker and primitive.
    ///
    /// Such a pointer carries no in-band header; it must never be passed to
    /// [`Builder::destroy`].
    #[must_use]
    pub fn build_from<T>(
        &self,
        object: NonNull<T>,
        annotation: ResourceAnnotation,
        cores: &CoreSet,
    ) -> ResourcePtr {
        let chosen = primitive::select_primitive(&annotation);
        let (home_worker, _) = self.schedule(&annotation, cores);
        ResourcePtr::new(object.as_ptr().cast(), home_worker, chosen)
    }

    /// Destroys a built resource.
    ///
    /// Optimistic resources are deferred to the epoch manager; all others
    /// are dropped and freed immediately.
    ///
    /// # Safety
    /// `resource` must come from [`Builder::build`] with the same `T`, be
    /// logically unlinked (no new readers can reach it) and not be
    /// destroyed twice. Owner contract: must run on the thread acting as
    /// `calling_worker`.
    pub unsafe fn destroy<T>(
        &self,
        calling_worker: WorkerId,
        resource: ResourcePtr,
        allocator: &Allocator,
        epochs: &EpochManager,
    ) {
        if resource.is_null() {
            return;
        }

        // Safety: built resources carry their header one cache line below.
        let user = unsafe { NonNull::new_unchecked(resource.get::<u8>()) };
        let header = unsafe { ResourceHeader::from_user_ptr(user) };

        if resource.primitive().is_optimistic() {
            // Readers may still hold the pointer; the epoch manager frees
            // it once every worker has moved past the current epoch.
            unsafe {
                epochs.defer(
                    resource.worker_id(),
                    header.as_ref().garbage_node(),
                    reclaim_resource::<T>,
                );
            }
        } else {
            // Safety: exclusive per the contract; drop then free the whole
            // allocation, which starts at the header.
            unsafe {
                std::ptr::drop_in_place(user.cast::<T>().as_ptr());
                allocator.free(calling_worker, header.cast());
            }
        }
    }
}

/// Reclamation hook: drops the user object and returns the allocation.
unsafe fn reclaim_resource<T>(
    node: NonNull<GarbageNode>,
    allocator: &Allocator,
    worker_id: WorkerId,
) {
    // Safety: the node is embedded in a resource header followed by a T.
    unsafe {
        let header = ResourceHeader::from_garbage_node(node);
        let user = header.as_ref().user_ptr();
        std::ptr::drop_in_place(user.cast::<T>().as_ptr());
        allocator.free(worker_id, header.cast());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::primitive::Protocol;

    fn cores(workers: usize) -> CoreSet {
        CoreSet::from_pairs((0..workers as u16).map(|cpu| (cpu, 0)))
    }

    fn harness(workers: usize) -> (Builder, Allocator, EpochManager, CoreSet) {
        let cores = cores(workers);
        let allocator = Allocator::new(&cores, 1 << 20);
        let epochs = EpochManager::new(workers);
        (Builder::new(workers), allocator, epochs, cores)
    }

    #[test]
    fn test_build_places_header_and_value() {
        let (builder, allocator, epochs, cores) = harness(2);
        let annotation = ResourceAnnotation::new()
            .on_worker(1)
            .with_isolation(IsolationLevel::Exclusive);
        let resource = unsafe { builder.build(0, 0, annotation, 0xDEAD_BEEFu64, &allocator, &cores) };

        assert!(!resource.is_null());
        assert_eq!(resource.worker_id(), 1);
        assert_eq!(resource.primitive(), Primitive::ScheduleAll);
        assert_eq!(resource.get::<u8>() as usize % 64, 0);
        unsafe {
            assert_eq!(*resource.get::<u64>(), 0xDEAD_BEEF);
            builder.destroy::<u64>(0, resource, &allocator, &epochs);
            assert!(allocator.is_free());
        }
    }

    #[test]
    fn test_out_of_range_worker_is_remapped() {
        let (builder, allocator, epochs, cores) = harness(2);
        let annotation = ResourceAnnotation::new().on_worker(7);
        let resource = unsafe { builder.build(0, 0, annotation, 1u32, &allocator, &cores) };
        assert_eq!(resource.worker_id(), 7 % 2);
        unsafe { builder.destroy::<u32>(0, resource, &allocator, &epochs) };
    }

    #[test]
    fn test_round_robin_skips_excessive_worker() {
        let (builder, allocator, epochs, cores) = harness(4);

        // Saturate worker 0's prediction.
        builder.predict_usage(0, AccessFrequency::Excessive);
        assert!(builder.has_excessive_usage(0));

        // Drive round-robin so worker 0 would be next, with Exclusive
        // isolation it must be skipped.
        let annotation = ResourceAnnotation::new().with_isolation(IsolationLevel::Exclusive);
        let mut homes = Vec::new();
        for _ in 0..8 {
            let resource = unsafe { builder.build(0, 0, annotation, 0u8, &allocator, &cores) };
            homes.push(resource.worker_id());
            unsafe { builder.destroy::<u8>(0, resource, &allocator, &epochs) };
        }
        assert!(!homes.contains(&0), "excessive worker must be skipped: {homes:?}");
    }

    #[test]
    fn test_optimistic_destroy_defers_to_epochs() {
        let (builder, allocator, epochs, cores) = harness(2);
        let annotation = ResourceAnnotation::new()
            .with_isolation(IsolationLevel::ExclusiveWriter)
            .with_protocol(Protocol::Olfit);
        let resource = unsafe { builder.build(0, 0, annotation, 7i64, &allocator, &cores) };
        assert_eq!(resource.primitive(), Primitive::Olfit);

        // A reader entered before the removal keeps the memory alive.
        epochs.enter(1);
        unsafe {
            builder.destroy::<i64>(0, resource, &allocator, &epochs);
            assert_eq!(epochs.reclaim(resource.worker_id(), &allocator), 0);
            assert!(!allocator.is_free());
        }

        epochs.leave(1);
        unsafe {
            assert_eq!(epochs.reclaim(resource.worker_id(), &allocator), 1);
            assert!(allocator.is_free());
        }
    }
}
