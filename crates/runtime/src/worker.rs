// SPDX-License-Identifier: Apache-2.0

//! The per-worker scheduling loop.
//!
//! A worker repeatedly: pops from its bound FIFO, drains remotely spawned
//! tasks into its local queues, pops from its stealable deque, and — only
//! when all of that comes up empty — steals half a batch from a victim,
//! preferring victims on its own NUMA node. Before executing a task it
//! prefetches the resource of the task `k` positions ahead in the bound
//! queue.

use crate::prefetch::{self, PrefetchDescriptor};
use crate::profiling::Counter;
use crate::resource::header::ResourceHeader;
use crate::resource::ptr::ResourcePtr;
use crate::scheduler::{QueueClass, Scheduler, TaskContext, WorkerLocal, WorkerState};
use crate::sync::primitive::Primitive;
use crate::sync::rtm;
use crate::task::{AccessIntention, Annotation, Target, TaskRef, TaskResult};
use crossbeam_deque::{Steal, Worker as WorkerDeque};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::ptr::NonNull;
use std::sync::Arc;
use taskmill_config::{PrefetchMode, WorkerId};
use taskmill_queue::Ring;

/// Loop iterations between maintenance passes (epoch advance, garbage
/// reclamation).
const MAINTENANCE_PERIOD: u64 = 64;

/// Maintenance passes between allocator remote-free drains.
const REFUND_PERIOD: u64 = 16;

/// Failed steal rounds before the worker yields the CPU.
const IDLE_SPINS_BEFORE_YIELD: u32 = 64;

pub(crate) struct Worker {
    scheduler: Arc<Scheduler>,
    local: WorkerLocal,
    rng: SmallRng,
    same_node_victims: Vec<WorkerId>,
    cross_node_victims: Vec<WorkerId>,
    /// Descriptors of upcoming tasks' resources, issued one per executed
    /// task.
    prefetch_ring: Ring<PrefetchDescriptor>,
    iterations: u64,
    maintenance_passes: u64,
}

impl Worker {
    pub(crate) fn new(scheduler: Arc<Scheduler>, id: WorkerId, deque: WorkerDeque<TaskRef>) -> Self {
        let my_node = scheduler.numa_node_of(id);
        let mut same_node_victims = Vec::new();
        let mut cross_node_victims = Vec::new();
        for victim in 0..scheduler.workers() {
            if victim == id {
                continue;
            }
            if scheduler.numa_node_of(victim) == my_node {
                same_node_victims.push(victim);
            } else {
                cross_node_victims.push(victim);
            }
        }

        let ring_capacity = match scheduler.prefetch_mode() {
            PrefetchMode::Disabled => 0,
            PrefetchMode::Fixed(k) => usize::from(k),
            PrefetchMode::Automatic { max_distance } => usize::from(max_distance),
        };

        Self {
            scheduler,
            local: WorkerLocal::new(id, deque),
            rng: SmallRng::seed_from_u64(0x9E37_79B9_7F4A_7C15 ^ u64::from(id)),
            same_node_victims,
            cross_node_victims,
            prefetch_ring: Ring::with_capacity(ring_capacity),
            iterations: 0,
            maintenance_passes: 0,
        }
    }

    fn id(&self) -> WorkerId {
        self.local.id
    }

    /// The scheduling loop. Runs until a stop is requested, then tears the
    /// worker down.
    pub(crate) fn run(mut self) {
        let id = self.id();
        self.scheduler.worker_started();
        self.scheduler.set_worker_state(id, WorkerState::Running);
        tracing::debug!(worker_id = id, "worker running");

        let mut idle_spins = 0u32;
        while !self.scheduler.is_stopping() {
            self.iterations += 1;
            if self.iterations % MAINTENANCE_PERIOD == 0 {
                self.maintenance();
            }

            if let Some(task) = self.next_task() {
                idle_spins = 0;
                self.run_task(task);
                continue;
            }

            // Empty queues: try to steal, NUMA-local victims first.
            self.scheduler.set_worker_state(id, WorkerState::Stealing);
            if let Some(task) = self.steal() {
                self.scheduler.set_worker_state(id, WorkerState::Running);
                self.scheduler.task_counters().increment(id, Counter::Stolen);
                idle_spins = 0;
                self.run_task(task);
                continue;
            }
            self.scheduler.set_worker_state(id, WorkerState::Running);

            idle_spins += 1;
            if idle_spins >= IDLE_SPINS_BEFORE_YIELD {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }

        self.teardown();
    }

    /// Pops the next runnable task: bound FIFO first, then freshly drained
    /// remote arrivals, then the stealable deque.
    fn next_task(&mut self) -> Option<TaskRef> {
        if let Some(task) = self.local.bound.borrow_mut().pop_front() {
            return Some(task);
        }

        self.drain_remote();
        if let Some(task) = self.local.bound.borrow_mut().pop_front() {
            return Some(task);
        }

        self.local.deque.pop()
    }

    /// Moves remotely spawned tasks into the local queues.
    fn drain_remote(&mut self) {
        // Safety: this worker is the single consumer of its remote queue.
        for raw in unsafe { self.scheduler.shared(self.id()).remote.drain() } {
            let task = TaskRef::from_raw(raw);
            let (_, class) = self.scheduler.route(&task.annotation(), self.id());
            match class {
                QueueClass::Bound => self.local.bound.borrow_mut().push_back(task),
                QueueClass::Stealable => self.local.deque.push(task),
            }
        }
    }

    /// Steals from a random victim, same-node victims first; the NUMA
    /// boundary is crossed only when every local victim came up empty.
    /// A successful steal moves half of the victim's stealable deque.
    fn steal(&mut self) -> Option<TaskRef> {
        if let Some(task) = self.steal_round(true) {
            return Some(task);
        }
        self.steal_round(false)
    }

    fn steal_round(&mut self, same_node: bool) -> Option<TaskRef> {
        let victims = if same_node {
            &self.same_node_victims
        } else {
            &self.cross_node_victims
        };
        if victims.is_empty() {
            return None;
        }
        let start = self.rng.random_range(0..victims.len());
        for offset in 0..victims.len() {
            let victim = victims[(start + offset) % victims.len()];
            let stealer = &self.scheduler.shared(victim).stealer;
            loop {
                match stealer.steal_batch_and_pop(&self.local.deque) {
                    Steal::Success(task) => return Some(task),
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        None
    }

    /// Periodic duties: worker 0 advances the global epoch; everyone walks
    /// its garbage list and occasionally folds remote frees back in.
    fn maintenance(&mut self) {
        self.maintenance_passes += 1;
        let id = self.id();
        if id == 0 {
            let _ = self.scheduler.epoch_manager().advance_global();
        }
        // Safety: owner contract — we are this worker's thread.
        unsafe {
            let _ = self
                .scheduler
                .epoch_manager()
                .reclaim(id, self.scheduler.allocator());
            if self.maintenance_passes % REFUND_PERIOD == 0 {
                self.scheduler.allocator().refund_remote_freed(id);
            }
        }
    }

    /// Executes one task: prefetch lookahead, primitive dispatch, result
    /// handling, and batched follow-ups.
    fn run_task(&mut self, task: TaskRef) {
        self.prefetch_ahead();

        let annotation = task.annotation();
        if self.scheduler.is_task_trace() {
            if let Some(trace_id) = task.trace_id() {
                tracing::trace!(worker_id = self.id(), trace_id, "task executed");
            }
        }

        let result = self.execute_dispatch(task, &annotation);
        self.account_execution(&annotation);
        self.handle_result(task, result);

        if let Target::Resource(resource) = annotation.target {
            if resource.primitive() == Primitive::Batched {
                self.run_batch(resource);
            }
        }
    }

    /// Buffers the descriptor of the task `k` positions ahead in the bound
    /// queue — `k` follows the configured mode — and issues one buffered
    /// descriptor per executed task.
    fn prefetch_ahead(&mut self) {
        let mode = self.scheduler.prefetch_mode();
        if !mode.is_enabled() {
            return;
        }
        {
            let bound = self.local.bound.borrow();
            let distance = prefetch::distance(mode, bound.len());
            if distance > 0 {
                if let Some(ahead) = bound.get(distance - 1) {
                    if let Some(descriptor) = ahead.annotation().prefetch {
                        let _ = self.prefetch_ring.push_evicting(descriptor);
                    }
                }
            }
        }
        if let Some(descriptor) = self.prefetch_ring.pop() {
            prefetch::issue(&descriptor);
            self.scheduler
                .task_counters()
                .increment(self.id(), Counter::Prefetched);
        }
    }

    fn account_execution(&self, annotation: &Annotation) {
        let counters = self.scheduler.task_counters();
        counters.increment(self.id(), Counter::Executed);
        match annotation.intention {
            AccessIntention::Read => counters.increment(self.id(), Counter::ExecutedReader),
            AccessIntention::Write => counters.increment(self.id(), Counter::ExecutedWriter),
        }
    }

    /// Runs the task body under the discipline of the resource it names.
    fn execute_dispatch(&self, task: TaskRef, annotation: &Annotation) -> TaskResult {
        let ctx = TaskContext::new(&self.scheduler, &self.local);

        let resource = match annotation.target {
            Target::Resource(resource) if !resource.is_null() => resource,
            // No resource named: the body synchronizes itself (or needs no
            // synchronization).
            // Safety: we own the dequeued task.
            _ => return unsafe { task.execute(&ctx) },
        };

        match resource.primitive() {
            // Home scheduling serializes; no runtime locking on this path.
            Primitive::None | Primitive::ScheduleAll | Primitive::Batched => {
                // Safety: we own the dequeued task.
                unsafe { task.execute(&ctx) }
            }
            Primitive::ScheduleWriter | Primitive::Optimistic | Primitive::Olfit => {
                let header = header_of(resource);
                if annotation.intention == AccessIntention::Read {
                    self.execute_optimistic_read(task, &ctx, header)
                } else {
                    self.execute_optimistic_write(task, &ctx, header)
                }
            }
            Primitive::ExclusiveLatch => {
                let header = header_of(resource);
                // Safety: live resource header per the builder layout.
                let latch = unsafe { header.as_ref() }.exclusive_latch();
                latch.lock();
                // Safety: we own the dequeued task.
                let result = unsafe { task.execute(&ctx) };
                latch.unlock();
                result
            }
            Primitive::ReaderWriterLatch => {
                let header = header_of(resource);
                // Safety: live resource header per the builder layout.
                let latch = unsafe { header.as_ref() }.rw_latch();
                if annotation.intention == AccessIntention::Read {
                    latch.lock_shared();
                    // Safety: we own the dequeued task.
                    let result = unsafe { task.execute(&ctx) };
                    latch.unlock_shared();
                    result
                } else {
                    latch.lock_exclusive();
                    // Safety: we own the dequeued task.
                    let result = unsafe { task.execute(&ctx) };
                    latch.unlock_exclusive();
                    result
                }
            }
            Primitive::Rtm => {
                let header = header_of(resource);
                // Safety: live resource header per the builder layout.
                let latch = unsafe { header.as_ref() }.exclusive_latch();
                // Safety: we own the dequeued task.
                rtm::execute(latch, || unsafe { task.execute(&ctx) })
            }
        }
    }

    /// Optimistic read: publish the epoch, snapshot the version, run,
    /// revalidate; re-execute the same task in place on mismatch.
    fn execute_optimistic_read(
        &self,
        task: TaskRef,
        ctx: &TaskContext<'_>,
        header: NonNull<ResourceHeader>,
    ) -> TaskResult {
        let epochs = self.scheduler.epoch_manager();
        epochs.enter(self.id());
        // Safety: live resource header per the builder layout.
        let latch = unsafe { header.as_ref() }.optimistic_latch();
        let result = loop {
            let version = latch.read_valid();
            // Safety: we own the dequeued task.
            let result = unsafe { task.execute(ctx) };
            if latch.is_valid(version) {
                break result;
            }
            // The attempt is void; discard any follow-up it produced
            // before re-executing.
            match result {
                TaskResult::Succeed(next) | TaskResult::SucceedAndRemove(next) => {
                    ctx.delete_task(next);
                }
                TaskResult::Remove | TaskResult::Stop { .. } => {}
            }
        };
        epochs.leave(self.id());
        result
    }

    /// Optimistic write: hold the internal latch, publish a new even
    /// version on release.
    fn execute_optimistic_write(
        &self,
        task: TaskRef,
        ctx: &TaskContext<'_>,
        header: NonNull<ResourceHeader>,
    ) -> TaskResult {
        let epochs = self.scheduler.epoch_manager();
        epochs.enter(self.id());
        // Safety: live resource header per the builder layout.
        let latch = unsafe { header.as_ref() }.optimistic_latch();
        latch.lock();
        // Safety: we own the dequeued task.
        let result = unsafe { task.execute(ctx) };
        latch.unlock();
        epochs.leave(self.id());
        result
    }

    fn handle_result(&mut self, task: TaskRef, result: TaskResult) {
        match result {
            TaskResult::Remove => {
                // Safety: the task finished; nothing else references it.
                unsafe { self.scheduler.delete_task(self.id(), task) };
            }
            TaskResult::Succeed(next) => {
                self.scheduler.spawn_with(next, self.id(), Some(&self.local));
            }
            TaskResult::SucceedAndRemove(next) => {
                self.scheduler.spawn_with(next, self.id(), Some(&self.local));
                // Safety: the task finished; nothing else references it.
                unsafe { self.scheduler.delete_task(self.id(), task) };
            }
            TaskResult::Stop { worker_id, abort } => {
                self.scheduler.request_stop(worker_id, abort);
                // Safety: the task finished; nothing else references it.
                unsafe { self.scheduler.delete_task(self.id(), task) };
            }
        }
    }

    /// Executes queued tasks for the same batched resource back-to-back.
    fn run_batch(&mut self, resource: ResourcePtr) {
        loop {
            let next = {
                let mut bound = self.local.bound.borrow_mut();
                match bound.front() {
                    Some(front) if targets_resource(&front.annotation(), resource) => {
                        bound.pop_front()
                    }
                    _ => None,
                }
            };
            let Some(task) = next else { break };
            let annotation = task.annotation();
            let result = self.execute_dispatch(task, &annotation);
            self.account_execution(&annotation);
            self.handle_result(task, result);
        }
    }

    /// Teardown after a stop: delete queued tasks, wait for the other
    /// workers to leave their loops, then reclaim deferred garbage and
    /// release free heap blocks.
    fn teardown(&mut self) {
        let id = self.id();
        self.scheduler.set_worker_state(id, WorkerState::Stopping);
        tracing::debug!(worker_id = id, "worker stopping");

        let mut dropped = 0usize;
        loop {
            let Some(task) = self.next_task() else { break };
            // Safety: the runtime is stopping; queued tasks never ran and
            // are exclusively ours after dequeue.
            unsafe { self.scheduler.delete_task(id, task) };
            dropped += 1;
        }
        if dropped > 0 && self.scheduler.is_aborting() {
            tracing::warn!(worker_id = id, dropped, "aborted with queued tasks");
        }

        // Reclaiming everything is only safe once no task body can still
        // hold an optimistic read — wait for every worker to stop looping.
        for other in 0..self.scheduler.workers() {
            while !matches!(
                self.scheduler.worker_state(other),
                WorkerState::Stopping | WorkerState::Terminated | WorkerState::Idle
            ) {
                std::hint::spin_loop();
            }
        }

        // Safety: owner contract; every worker has left its loop.
        unsafe {
            let _ = self
                .scheduler
                .epoch_manager()
                .reclaim_all(id, self.scheduler.allocator());
            self.scheduler.allocator().clean_up(id);
        }

        self.scheduler.set_worker_state(id, WorkerState::Terminated);
        self.scheduler.worker_terminated();
        tracing::debug!(worker_id = id, "worker terminated");
    }
}

fn header_of(resource: ResourcePtr) -> NonNull<ResourceHeader> {
    // Safety: dispatch only reaches this for built resources, whose header
    // sits one cache line before the object.
    unsafe {
        let user = NonNull::new_unchecked(resource.get::<u8>());
        ResourceHeader::from_user_ptr(user)
    }
}

fn targets_resource(annotation: &Annotation, resource: ResourcePtr) -> bool {
    matches!(annotation.target, Target::Resource(named) if named == resource)
}
