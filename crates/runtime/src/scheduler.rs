// SPDX-License-Identifier: Apache-2.0

//! The scheduler: shared worker state, task routing, and the per-task
//! context through which bodies talk to the engine.
//!
//! Every worker owns two queues: a *bound* FIFO for tasks that must run on
//! it (specific-worker annotations and home-scheduled resources — these are
//! structurally unstealable) and a *stealable* deque for tasks that merely
//! prefer it. Tasks arriving from other threads travel through a lock-free
//! MPSC queue and are routed into the right local queue when the owner
//! drains it.

use crate::profiling::{Counter, TaskCounters};
use crate::resource::annotation::ResourceAnnotation;
use crate::resource::builder::Builder;
use crate::squad::Squad;
use crate::sync::primitive::{IsolationLevel, Primitive};
use crate::task::{
    AccessIntention, Annotation, RawTask, Target, Task, TaskCell, TaskRef, TaskResult,
};
use crossbeam_deque::{Stealer, Worker as WorkerDeque};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicUsize, Ordering};
use taskmill_alloc::{Allocator, CACHE_LINE_SIZE, EpochManager};
use taskmill_config::{CoreSet, NumaNodeId, PrefetchMode, RuntimeConfig, WorkerId};
use taskmill_queue::MpscQueue;

/// Observable lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Spawned, not yet scheduling.
    Idle = 0,
    /// Executing or looking at its own queues.
    Running = 1,
    /// Out of local work, probing victims.
    Stealing = 2,
    /// Stop observed, tearing down.
    Stopping = 3,
    /// Thread about to exit.
    Terminated = 4,
}

impl WorkerState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => WorkerState::Running,
            2 => WorkerState::Stealing,
            3 => WorkerState::Stopping,
            4 => WorkerState::Terminated,
            _ => WorkerState::Idle,
        }
    }
}

/// Which local queue a task belongs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueClass {
    /// Must run on the destination worker; never stolen.
    Bound,
    /// Prefers the destination worker; may be stolen.
    Stealable,
}

/// The shared (cross-thread visible) part of one worker.
pub(crate) struct WorkerShared {
    /// Tasks spawned onto this worker from other threads.
    pub(crate) remote: MpscQueue<RawTask>,
    /// Steal handle of the worker's stealable deque.
    pub(crate) stealer: Stealer<TaskRef>,
    /// Lifecycle state for introspection.
    pub(crate) state: AtomicU8,
    /// NUMA node of the worker's CPU.
    pub(crate) numa_node_id: NumaNodeId,
}

/// The thread-private part of one worker, shared with task bodies through
/// the [`TaskContext`].
pub struct WorkerLocal {
    pub(crate) id: WorkerId,
    /// Bound FIFO: specific-worker tasks and home-scheduled resources.
    pub(crate) bound: RefCell<VecDeque<TaskRef>>,
    /// Stealable pool.
    pub(crate) deque: WorkerDeque<TaskRef>,
}

impl WorkerLocal {
    pub(crate) fn new(id: WorkerId, deque: WorkerDeque<TaskRef>) -> Self {
        Self {
            id,
            bound: RefCell::new(VecDeque::with_capacity(256)),
            deque,
        }
    }
}

/// Engine-wide scheduler state shared by all workers.
pub struct Scheduler {
    cores: CoreSet,
    prefetch: PrefetchMode,
    task_trace: bool,
    allocator: Allocator,
    epochs: EpochManager,
    builder: Builder,
    counters: TaskCounters,
    shared: Box<[WorkerShared]>,
    numa_round_robin: AtomicU16,
    stop: AtomicBool,
    abort: AtomicBool,
    active_workers: AtomicUsize,
}

impl Scheduler {
    /// Builds the scheduler and the per-worker deques the worker threads
    /// will own.
    pub(crate) fn new(config: &RuntimeConfig) -> (Self, Vec<WorkerDeque<TaskRef>>) {
        let workers = config.cores.len();
        let deques: Vec<WorkerDeque<TaskRef>> =
            (0..workers).map(|_| WorkerDeque::new_fifo()).collect();
        let shared = deques
            .iter()
            .enumerate()
            .map(|(worker_id, deque)| WorkerShared {
                remote: MpscQueue::new(),
                stealer: deque.stealer(),
                state: AtomicU8::new(WorkerState::Idle as u8),
                numa_node_id: config.cores.numa_node_of(worker_id),
            })
            .collect();

        let scheduler = Self {
            cores: config.cores.clone(),
            prefetch: config.prefetch,
            task_trace: config.task_trace,
            allocator: Allocator::new(&config.cores, config.allocator_block_size),
            epochs: EpochManager::new(workers),
            builder: Builder::new(workers),
            counters: TaskCounters::new(workers, config.task_counter),
            shared,
            numa_round_robin: AtomicU16::new(0),
            stop: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
        };
        (scheduler, deques)
    }

    /// Number of workers.
    #[must_use]
    pub fn workers(&self) -> u16 {
        self.cores.len() as u16
    }

    /// The engine's core set.
    #[must_use]
    pub fn cores(&self) -> &CoreSet {
        &self.cores
    }

    /// NUMA node of a worker's CPU.
    #[must_use]
    pub fn numa_node_of(&self, worker_id: WorkerId) -> NumaNodeId {
        self.shared[usize::from(worker_id)].numa_node_id
    }

    /// The configured prefetch mode.
    #[must_use]
    pub fn prefetch_mode(&self) -> PrefetchMode {
        self.prefetch
    }

    /// True when task tracing is recorded.
    #[must_use]
    pub fn is_task_trace(&self) -> bool {
        self.task_trace
    }

    /// The engine's allocator.
    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// The engine's epoch manager.
    #[must_use]
    pub fn epoch_manager(&self) -> &EpochManager {
        &self.epochs
    }

    /// The engine's resource builder.
    #[must_use]
    pub fn resource_builder(&self) -> &Builder {
        &self.builder
    }

    /// The engine's task counters.
    #[must_use]
    pub fn task_counters(&self) -> &TaskCounters {
        &self.counters
    }

    /// Lifecycle state of a worker.
    #[must_use]
    pub fn worker_state(&self, worker_id: WorkerId) -> WorkerState {
        WorkerState::from_bits(self.shared[usize::from(worker_id)].state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_worker_state(&self, worker_id: WorkerId, state: WorkerState) {
        self.shared[usize::from(worker_id)]
            .state
            .store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn shared(&self, worker_id: WorkerId) -> &WorkerShared {
        &self.shared[usize::from(worker_id)]
    }

    pub(crate) fn worker_started(&self) {
        let _ = self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn worker_terminated(&self) {
        let _ = self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of workers that entered their loop and have not terminated.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// True once a stop was requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// True when queued (not yet running) work should be discarded loudly.
    #[must_use]
    pub fn is_aborting(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Requests a runtime-wide stop; polled by workers between tasks.
    pub fn request_stop(&self, worker_id: WorkerId, abort: bool) {
        if abort {
            self.abort.store(true, Ordering::Relaxed);
        }
        if !self.stop.swap(true, Ordering::SeqCst) {
            tracing::info!(worker_id, abort, "runtime stop requested");
        }
    }

    /// Resolves where a task must go and in which queue class.
    pub(crate) fn route(&self, annotation: &Annotation, caller: WorkerId) -> (WorkerId, QueueClass) {
        let count = self.workers();
        match annotation.target {
            Target::Local => (caller, QueueClass::Stealable),
            Target::Worker(worker_id) => (worker_id % count, QueueClass::Bound),
            Target::NumaNode(numa_node_id) => {
                if self.numa_node_of(caller) == numa_node_id {
                    (caller, QueueClass::Stealable)
                } else {
                    let on_node: Vec<usize> = self.cores.workers_on_node(numa_node_id).collect();
                    if on_node.is_empty() {
                        (caller, QueueClass::Stealable)
                    } else {
                        let slot = self.numa_round_robin.fetch_add(1, Ordering::Relaxed);
                        (on_node[usize::from(slot) % on_node.len()] as WorkerId, QueueClass::Stealable)
                    }
                }
            }
            Target::Resource(resource) => {
                if resource.is_null() {
                    return (caller, QueueClass::Stealable);
                }
                let home = resource.worker_id() % count;
                match resource.primitive() {
                    Primitive::ScheduleAll | Primitive::Batched => (home, QueueClass::Bound),
                    Primitive::ScheduleWriter => {
                        if annotation.intention == AccessIntention::Read {
                            (caller, QueueClass::Stealable)
                        } else {
                            (home, QueueClass::Bound)
                        }
                    }
                    // Latched and optimistic resources synchronize in the
                    // task body; the task runs wherever it was spawned.
                    _ => (caller, QueueClass::Stealable),
                }
            }
        }
    }

    /// Dispatches a task. `local` is the spawning worker's queue pair when
    /// the spawn happens on a worker thread.
    pub(crate) fn spawn_with(&self, task: TaskRef, caller: WorkerId, local: Option<&WorkerLocal>) {
        self.counters.increment(caller, Counter::Dispatched);
        let annotation = task.annotation();
        let (destination, class) = self.route(&annotation, caller);

        if let Some(local) = local {
            if local.id == destination {
                self.counters.increment(caller, Counter::DispatchedLocally);
                match class {
                    QueueClass::Bound => local.bound.borrow_mut().push_back(task),
                    QueueClass::Stealable => local.deque.push(task),
                }
                return;
            }
        }

        self.counters.increment(caller, Counter::DispatchedRemotely);
        // Safety: the task is live and ownership moves to the queue.
        unsafe {
            self.shared[usize::from(destination)].remote.push(task.as_raw());
        }
    }

    /// Allocates and initializes a task cell on `worker_id`'s heap.
    ///
    /// # Safety
    /// Owner contract: must run on the thread acting as `worker_id`.
    pub(crate) unsafe fn new_task_on_worker<T: Task>(&self, worker_id: WorkerId, task: T) -> TaskRef {
        let size = size_of::<TaskCell<T>>();
        // Safety: owner contract forwarded.
        let memory = unsafe {
            self.allocator
                .allocate(worker_id, self.numa_node_of(worker_id), CACHE_LINE_SIZE, size)
        }
        .unwrap_or_else(|| panic!("worker {worker_id} heap exhausted allocating a task"));
        // Safety: fresh allocation of the right size and alignment.
        unsafe { TaskCell::init(memory, task, false) }
    }

    /// Allocates a task with the global allocator (spawning thread is not a
    /// worker).
    pub(crate) fn new_task_external<T: Task>(&self, task: T) -> TaskRef {
        let layout = std::alloc::Layout::new::<TaskCell<T>>();
        // Safety: layout has non-zero size (header alone is non-zero).
        let memory = NonNull::new(unsafe { std::alloc::alloc(layout) })
            .unwrap_or_else(|| panic!("global allocation of a task failed"));
        // Safety: fresh allocation of the right size and alignment.
        unsafe { TaskCell::init(memory, task, true) }
    }

    /// Drops and frees a task.
    ///
    /// # Safety
    /// Exclusive ownership of the task; owner contract for `caller` when
    /// the task lives on a worker heap.
    pub(crate) unsafe fn delete_task(&self, caller: WorkerId, task: TaskRef) {
        // Safety: exclusive ownership per the contract.
        unsafe {
            task.drop_payload();
            if task.is_external() {
                std::alloc::dealloc(task.as_raw().as_ptr().cast(), task.dealloc_layout());
            } else {
                self.allocator.free(caller, task.as_raw().cast());
            }
        }
    }
}

/// The engine surface available inside a task body, bound to the executing
/// worker.
pub struct TaskContext<'a> {
    scheduler: &'a Scheduler,
    local: &'a WorkerLocal,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(scheduler: &'a Scheduler, local: &'a WorkerLocal) -> Self {
        Self { scheduler, local }
    }

    /// The executing worker.
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.local.id
    }

    /// Number of workers in the engine.
    #[must_use]
    pub fn workers(&self) -> u16 {
        self.scheduler.workers()
    }

    /// The NUMA node of the executing worker.
    #[must_use]
    pub fn numa_node_id(&self) -> NumaNodeId {
        self.scheduler.numa_node_of(self.local.id)
    }

    /// The scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        self.scheduler
    }

    /// Creates a task on this worker's heap. The annotation defaults to
    /// local execution; adjust it before spawning.
    pub fn new_task<T: Task>(&self, task: T) -> TaskRef {
        // Safety: the context is only handed to bodies running on this
        // worker's thread.
        unsafe { self.scheduler.new_task_on_worker(self.local.id, task) }
    }

    /// Creates a closure task on this worker's heap.
    pub fn new_lambda_task<F>(&self, body: F) -> TaskRef
    where
        F: FnMut(&TaskContext<'_>) -> TaskResult + Send + 'static,
    {
        self.new_task(crate::task::LambdaTask::new(body))
    }

    /// Schedules a task according to its annotation.
    pub fn spawn(&self, task: TaskRef) {
        self.scheduler.spawn_with(task, self.local.id, Some(self.local));
    }

    /// Drops and frees a task that will not be spawned (or was returned to
    /// the caller via [`TaskResult::Succeed`] and is no longer needed).
    pub fn delete_task(&self, task: TaskRef) {
        // Safety: context runs on this worker's thread; the caller owns
        // the task per this method's contract.
        unsafe { self.scheduler.delete_task(self.local.id, task) };
    }

    /// Builds a resource of type `T`.
    ///
    /// Returns the null pointer on OOM, which the runtime treats as fatal
    /// at its own allocation sites.
    pub fn new_resource<T>(&self, annotation: ResourceAnnotation, value: T) -> crate::ResourcePtr {
        self.new_resource_sized(0, annotation, value)
    }

    /// Builds a resource reserving at least `size` bytes for the object.
    pub fn new_resource_sized<T>(
        &self,
        size: usize,
        annotation: ResourceAnnotation,
        value: T,
    ) -> crate::ResourcePtr {
        // Safety: the context runs on this worker's thread.
        unsafe {
            self.scheduler.builder.build(
                self.local.id,
                size,
                annotation,
                value,
                &self.scheduler.allocator,
                &self.scheduler.cores,
            )
        }
    }

    /// Destroys a resource built with [`TaskContext::new_resource`].
    ///
    /// # Safety
    /// `resource` must have been built with the same `T`, be unlinked, and
    /// not be destroyed twice.
    pub unsafe fn delete_resource<T>(&self, resource: crate::ResourcePtr) {
        // Safety: forwarded contract; context runs on this worker.
        unsafe {
            self.scheduler.builder.destroy::<T>(
                self.local.id,
                resource,
                &self.scheduler.allocator,
                &self.scheduler.epochs,
            );
        }
    }

    /// Creates a squad — a scheduler-managed FIFO of deferred tasks —
    /// homed on the given worker.
    pub fn new_squad(&self, home_worker: WorkerId) -> crate::ResourcePtr {
        let annotation = ResourceAnnotation::new()
            .on_worker(home_worker)
            .with_isolation(IsolationLevel::Exclusive);
        self.new_resource(annotation, Squad::new())
    }

    /// The engine's epoch manager.
    #[must_use]
    pub fn epoch_manager(&self) -> &EpochManager {
        &self.scheduler.epochs
    }
}
