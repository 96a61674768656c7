// SPDX-License-Identifier: Apache-2.0

//! Epoch-based memory reclamation.
//!
//! Readers of optimistically synchronized resources publish the global
//! epoch as their local epoch for the duration of a task and advertise a
//! quiescent sentinel otherwise. A removed resource is stamped with the
//! global epoch at removal time and destructed only once every non-quiescent
//! worker has published a strictly newer local epoch — at that point no
//! reader can still hold the pointer.
//!
//! Epoch publications use sequentially consistent ordering: the proof of
//! safety needs "reader publishes epoch, then loads pointer" and "writer
//! unlinks pointer, then stamps epoch" to be globally ordered.

use crate::allocator::Allocator;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use taskmill_config::WorkerId;
use taskmill_queue::{Link, MpscQueue};

/// A point on the global reclamation timeline.
pub type Epoch = u64;

/// Local-epoch sentinel of a worker that is outside any epoch-guarded task.
pub const QUIESCENT: Epoch = Epoch::MAX;

/// Destructor invoked when a deferred resource is finally reclaimed.
///
/// Receives the allocator owning the resource's memory and the worker the
/// reclamation pass runs on, so the hook can return the memory through the
/// regular free path.
pub type DropFn = unsafe fn(NonNull<GarbageNode>, &Allocator, WorkerId);

/// The intrusive reclamation header embedded in every deferred resource.
///
/// The embedding type registers a [`DropFn`] that recovers the container
/// from the node pointer, drops it and returns its memory.
#[repr(C)]
pub struct GarbageNode {
    link: AtomicPtr<GarbageNode>,
    remove_epoch: AtomicU64,
    drop_fn: UnsafeCell<DropFn>,
}

unsafe impl Link for GarbageNode {
    fn link(&self) -> &AtomicPtr<GarbageNode> {
        &self.link
    }
}

unsafe fn unreachable_drop(_node: NonNull<GarbageNode>, _allocator: &Allocator, _worker_id: WorkerId) {
    unreachable!("garbage node reclaimed before registration");
}

impl GarbageNode {
    /// Creates an unregistered node.
    #[must_use]
    pub fn new() -> Self {
        Self {
            link: AtomicPtr::new(ptr::null_mut()),
            remove_epoch: AtomicU64::new(0),
            drop_fn: UnsafeCell::new(unreachable_drop),
        }
    }

    /// The epoch this resource was removed at.
    #[must_use]
    pub fn remove_epoch(&self) -> Epoch {
        self.remove_epoch.load(Ordering::Relaxed)
    }
}

impl Default for GarbageNode {
    fn default() -> Self {
        Self::new()
    }
}

struct GarbageSlot {
    /// Removals registered by any worker for this worker's list.
    incoming: MpscQueue<GarbageNode>,
    /// Owner-only chain of nodes awaiting a safe epoch.
    pending: UnsafeCell<*mut GarbageNode>,
}

// `pending` is owner-only (unsafe contracts below); `incoming` is an MPSC.
unsafe impl Send for GarbageSlot {}
unsafe impl Sync for GarbageSlot {}

/// Global epoch, per-worker local epochs and per-worker garbage lists.
pub struct EpochManager {
    global: CachePadded<AtomicU64>,
    local: Box<[CachePadded<AtomicU64>]>,
    garbage: Box<[GarbageSlot]>,
}

impl EpochManager {
    /// Creates a manager for `workers` workers; all start quiescent.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            global: CachePadded::new(AtomicU64::new(1)),
            local: (0..workers)
                .map(|_| CachePadded::new(AtomicU64::new(QUIESCENT)))
                .collect(),
            garbage: (0..workers)
                .map(|_| GarbageSlot {
                    incoming: MpscQueue::new(),
                    pending: UnsafeCell::new(ptr::null_mut()),
                })
                .collect(),
        }
    }

    /// Number of workers tracked.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.local.len()
    }

    /// Current global epoch.
    #[must_use]
    pub fn global_epoch(&self) -> Epoch {
        self.global.load(Ordering::SeqCst)
    }

    /// Advances the global epoch by one and returns the new value.
    pub fn advance_global(&self) -> Epoch {
        self.global.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Publishes the current global epoch as `worker_id`'s local epoch.
    /// Called on entering a task that may touch optimistic resources.
    pub fn enter(&self, worker_id: WorkerId) {
        let epoch = self.global.load(Ordering::SeqCst);
        self.local[usize::from(worker_id)].store(epoch, Ordering::SeqCst);
    }

    /// Publishes the quiescent sentinel for `worker_id`. Called on leaving
    /// an epoch-guarded task.
    pub fn leave(&self, worker_id: WorkerId) {
        self.local[usize::from(worker_id)].store(QUIESCENT, Ordering::SeqCst);
    }

    /// The local epoch currently advertised by a worker.
    #[must_use]
    pub fn local_epoch(&self, worker_id: WorkerId) -> Epoch {
        self.local[usize::from(worker_id)].load(Ordering::SeqCst)
    }

    /// The oldest epoch any non-quiescent worker advertises, or
    /// [`QUIESCENT`] when every worker is quiescent.
    #[must_use]
    pub fn min_active_epoch(&self) -> Epoch {
        self.local
            .iter()
            .map(|cell| cell.load(Ordering::SeqCst))
            .min()
            .unwrap_or(QUIESCENT)
    }

    /// Registers a removed resource on `home_worker`'s garbage list,
    /// stamped with the current global epoch. May be called from any
    /// worker.
    ///
    /// # Safety
    /// `node` must stay valid until the manager invokes `drop_fn`, and the
    /// caller must have unlinked the resource (no new readers can reach it)
    /// before this call.
    pub unsafe fn defer(&self, home_worker: WorkerId, node: NonNull<GarbageNode>, drop_fn: DropFn) {
        // Safety: the node is ours until it is queued.
        unsafe {
            *node.as_ref().drop_fn.get() = drop_fn;
        }
        // The removal is published by the caller before this stamp; SeqCst
        // keeps the stamp ordered after it for every observer.
        let epoch = self.global.load(Ordering::SeqCst);
        unsafe { node.as_ref() }
            .remove_epoch
            .store(epoch, Ordering::SeqCst);
        // Safety: node outlives its queue residency per the contract.
        unsafe { self.garbage[usize::from(home_worker)].incoming.push(node) };
    }

    /// Walks `worker_id`'s garbage list and destructs every resource whose
    /// remove-epoch lies strictly before the oldest active local epoch.
    /// Returns the number of reclaimed resources.
    ///
    /// # Safety
    /// Owner contract: must be called from the thread acting as
    /// `worker_id`.
    pub unsafe fn reclaim(&self, worker_id: WorkerId, allocator: &Allocator) -> usize {
        // Safety: owner contract — single consumer of queue and chain.
        unsafe { self.reclaim_older_than(worker_id, self.min_active_epoch(), allocator) }
    }

    /// Unconditionally destructs every queued resource of one worker.
    /// Reserved for teardown, after all workers stopped.
    ///
    /// # Safety
    /// Owner contract, and no reader may be live anywhere.
    pub unsafe fn reclaim_all(&self, worker_id: WorkerId, allocator: &Allocator) -> usize {
        // Safety: forwarded contract.
        unsafe { self.reclaim_older_than(worker_id, QUIESCENT, allocator) }
    }

    unsafe fn reclaim_older_than(
        &self,
        worker_id: WorkerId,
        bound: Epoch,
        allocator: &Allocator,
    ) -> usize {
        let slot = &self.garbage[usize::from(worker_id)];

        // Safety: owner contract — we are the single consumer.
        let pending = unsafe { &mut *slot.pending.get() };
        for node in unsafe { slot.incoming.drain() } {
            // Safety: drained nodes are exclusively ours.
            unsafe { node.as_ref() }.link.store(*pending, Ordering::Relaxed);
            *pending = node.as_ptr();
        }

        let mut reclaimed = 0;
        let mut kept: *mut GarbageNode = ptr::null_mut();
        let mut cursor = std::mem::replace(pending, ptr::null_mut());
        while let Some(node) = NonNull::new(cursor) {
            // Safety: chained nodes are exclusively ours.
            let node_ref = unsafe { node.as_ref() };
            cursor = node_ref.link.load(Ordering::Relaxed);

            if node_ref.remove_epoch() < bound {
                // Safety: no worker advertises an epoch at or before the
                // remove-epoch, so no reader can still hold the pointer.
                let drop_fn = unsafe { *node_ref.drop_fn.get() };
                unsafe { drop_fn(node, allocator, worker_id) };
                reclaimed += 1;
            } else {
                node_ref.link.store(kept, Ordering::Relaxed);
                kept = node.as_ptr();
            }
        }
        *pending = kept;

        if reclaimed > 0 {
            tracing::trace!(worker_id, reclaimed, "reclaimed deferred resources");
        }
        reclaimed
    }
}
