// SPDX-License-Identifier: Apache-2.0

//! Tasks: the unit of work the runtime schedules.
//!
//! A task is a heap object carrying a body ([`Task::execute`]), an
//! [`Annotation`] stating where it should run, and an intrusive link for
//! the cross-worker queues. Tasks are allocated from the spawning worker's
//! heap, run to completion in microseconds, and report what happens next
//! through their [`TaskResult`].

use crate::prefetch::PrefetchDescriptor;
use crate::resource::ptr::ResourcePtr;
use crate::scheduler::TaskContext;
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::AtomicPtr;
use taskmill_config::{NumaNodeId, WorkerId};
use taskmill_queue::Link;

/// Where a task should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    /// On the worker that spawns it.
    #[default]
    Local,
    /// On one specific worker. Never stolen.
    Worker(WorkerId),
    /// On any worker of the given NUMA node.
    NumaNode(NumaNodeId),
    /// Wherever the named resource's primitive dictates.
    Resource(ResourcePtr),
}

/// Whether a task only reads the resource it names.
///
/// Read-only tasks on `ScheduleWriter` resources run on any worker and
/// validate optimistically; under a reader/writer latch they take the
/// shared side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessIntention {
    /// The task may mutate the resource.
    #[default]
    Write,
    /// The task only reads the resource. The body must be restartable:
    /// optimistic validation re-executes it on version mismatch.
    Read,
}

/// Scheduling annotation of a task.
#[derive(Debug, Clone, Copy, Default)]
pub struct Annotation {
    /// Placement of the task.
    pub target: Target,
    /// Read/write intention towards the named resource.
    pub intention: AccessIntention,
    /// Data to prefetch shortly before the task executes.
    pub prefetch: Option<PrefetchDescriptor>,
}

impl From<Target> for Annotation {
    fn from(target: Target) -> Self {
        Annotation {
            target,
            ..Annotation::default()
        }
    }
}

impl From<WorkerId> for Annotation {
    fn from(worker_id: WorkerId) -> Self {
        Target::Worker(worker_id).into()
    }
}

impl From<ResourcePtr> for Annotation {
    fn from(resource: ResourcePtr) -> Self {
        Target::Resource(resource).into()
    }
}

/// What a task hands back to the scheduling loop.
pub enum TaskResult {
    /// The task is done; the runtime deletes it.
    Remove,
    /// Schedule the given follow-up task; the current task stays alive
    /// (its owner keeps it, e.g. for re-spawning).
    Succeed(TaskRef),
    /// Schedule the follow-up and delete the current task.
    SucceedAndRemove(TaskRef),
    /// Shut down the runtime. In-flight tasks run to completion.
    Stop {
        /// Worker that requested the shutdown.
        worker_id: WorkerId,
        /// True to discard queued work during teardown diagnostics.
        abort: bool,
    },
}

impl TaskResult {
    /// Convenience constructor for a plain stop.
    #[must_use]
    pub fn stop(worker_id: WorkerId) -> Self {
        TaskResult::Stop {
            worker_id,
            abort: false,
        }
    }
}

/// A task body.
///
/// Implementations must run to completion without blocking; there is no
/// preemption and no suspension point inside a task. Tasks are `Send`
/// because spawning and stealing move them between workers.
pub trait Task: Send + 'static {
    /// Executes the task on the given worker.
    fn execute(&mut self, ctx: &TaskContext<'_>) -> TaskResult;

    /// Optional trace id, forwarded to the task-trace facility.
    fn trace_id(&self) -> Option<u64> {
        None
    }
}

/// A closure task, the bread and butter of job bootstrap code.
pub struct LambdaTask<F>
where
    F: FnMut(&TaskContext<'_>) -> TaskResult + Send + 'static,
{
    body: F,
}

impl<F> LambdaTask<F>
where
    F: FnMut(&TaskContext<'_>) -> TaskResult + Send + 'static,
{
    /// Wraps a closure as a task.
    pub fn new(body: F) -> Self {
        Self { body }
    }
}

impl<F> Task for LambdaTask<F>
where
    F: FnMut(&TaskContext<'_>) -> TaskResult + Send + 'static,
{
    fn execute(&mut self, ctx: &TaskContext<'_>) -> TaskResult {
        (self.body)(ctx)
    }
}

/// In-band head of every allocated task: queue link, annotation, and the
/// unsized view of the payload.
#[repr(C)]
pub struct RawTask {
    link: AtomicPtr<RawTask>,
    annotation: Cell<Annotation>,
    /// Allocated with the global allocator instead of a worker heap
    /// (tasks created outside any worker).
    external: bool,
    /// Cell size and alignment, kept for the global-allocator free path.
    size: u32,
    align: u32,
    poly: Option<NonNull<dyn Task>>,
}

unsafe impl Link for RawTask {
    fn link(&self) -> &AtomicPtr<RawTask> {
        &self.link
    }
}

/// One allocation: header plus the concrete task payload.
#[repr(C)]
pub struct TaskCell<T> {
    raw: RawTask,
    task: T,
}

impl<T: Task> TaskCell<T> {
    /// Writes a task cell into `memory` and returns the handle.
    ///
    /// # Safety
    /// `memory` must be valid for writes of `size_of::<TaskCell<T>>()`
    /// bytes and aligned to `align_of::<TaskCell<T>>()`.
    pub unsafe fn init(memory: NonNull<u8>, task: T, external: bool) -> TaskRef {
        const {
            assert!(
                align_of::<TaskCell<T>>() <= 64,
                "task types must not exceed cache-line alignment"
            );
        }
        let cell = memory.cast::<TaskCell<T>>();
        // Safety: memory is valid per the contract.
        unsafe {
            cell.as_ptr().write(TaskCell {
                raw: RawTask {
                    link: AtomicPtr::new(std::ptr::null_mut()),
                    annotation: Cell::new(Annotation::default()),
                    external,
                    size: size_of::<TaskCell<T>>() as u32,
                    align: align_of::<TaskCell<T>>() as u32,
                    poly: None,
                },
                task,
            });
            let poly: NonNull<dyn Task> = NonNull::from(&mut (*cell.as_ptr()).task);
            (*cell.as_ptr()).raw.poly = Some(poly);
            TaskRef::from_raw(cell.cast::<RawTask>())
        }
    }
}

/// Handle to an allocated task.
///
/// The handle is a plain pointer: copying it does not copy the task.
/// Exactly one place may own a task at a time — the spawner until `spawn`,
/// a queue until dequeue, the executing worker until its result is acted
/// on.
#[derive(Clone, Copy, Debug)]
pub struct TaskRef {
    raw: NonNull<RawTask>,
}

// Tasks are moved between threads through queues, and pre-built task webs
// (e.g. reduce tournaments) share handles read-only across workers; the
// ownership discipline above makes both sound.
unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

impl TaskRef {
    /// Wraps a raw task pointer.
    #[must_use]
    pub fn from_raw(raw: NonNull<RawTask>) -> Self {
        Self { raw }
    }

    /// The raw task pointer.
    #[must_use]
    pub fn as_raw(self) -> NonNull<RawTask> {
        self.raw
    }

    /// The current annotation.
    #[must_use]
    pub fn annotation(self) -> Annotation {
        // Safety: the handle points to a live task.
        unsafe { self.raw.as_ref() }.annotation.get()
    }

    /// Replaces the annotation. Must only be called while the caller owns
    /// the task (before spawning it).
    pub fn annotate(self, annotation: impl Into<Annotation>) {
        // Safety: the handle points to a live task; pre-spawn the spawner
        // is the only accessor.
        unsafe { self.raw.as_ref() }.annotation.set(annotation.into());
    }

    /// Sets only the placement target, keeping intention and prefetch.
    pub fn set_target(self, target: Target) {
        let mut annotation = self.annotation();
        annotation.target = target;
        self.annotate(annotation);
    }

    /// Sets only the access intention.
    pub fn set_intention(self, intention: AccessIntention) {
        let mut annotation = self.annotation();
        annotation.intention = intention;
        self.annotate(annotation);
    }

    /// Sets only the prefetch descriptor.
    pub fn set_prefetch(self, prefetch: PrefetchDescriptor) {
        let mut annotation = self.annotation();
        annotation.prefetch = Some(prefetch);
        self.annotate(annotation);
    }

    /// True when the task was allocated outside the worker heaps.
    #[must_use]
    pub fn is_external(self) -> bool {
        // Safety: the handle points to a live task.
        unsafe { self.raw.as_ref() }.external
    }

    /// Layout of the task cell, used to return external tasks to the
    /// global allocator.
    #[must_use]
    pub fn dealloc_layout(self) -> std::alloc::Layout {
        // Safety: the handle points to a live task.
        let raw = unsafe { self.raw.as_ref() };
        // Safety: recorded from a valid layout at initialization.
        unsafe {
            std::alloc::Layout::from_size_align_unchecked(raw.size as usize, raw.align as usize)
        }
    }

    /// The task's trace id, if any.
    #[must_use]
    pub fn trace_id(self) -> Option<u64> {
        // Safety: the handle points to a live task.
        let raw = unsafe { self.raw.as_ref() };
        raw.poly
            .map(|poly| unsafe { poly.as_ref() }.trace_id())
            .unwrap_or(None)
    }

    /// Runs the task body.
    ///
    /// # Safety
    /// The caller must exclusively own the task (dequeued, not yet
    /// deleted), and `ctx` must describe the executing worker.
    pub unsafe fn execute(self, ctx: &TaskContext<'_>) -> TaskResult {
        // Safety: exclusive ownership per the contract.
        let raw = unsafe { self.raw.as_ref() };
        let mut poly = raw.poly.expect("task executed before initialization");
        unsafe { poly.as_mut() }.execute(ctx)
    }

    /// Drops the task payload in place. The memory is released separately
    /// by whoever allocated it.
    ///
    /// # Safety
    /// Exclusive ownership; the payload must not be dropped twice.
    pub unsafe fn drop_payload(self) {
        // Safety: exclusive ownership per the contract.
        let raw = unsafe { self.raw.as_ref() };
        if let Some(poly) = raw.poly {
            unsafe { std::ptr::drop_in_place(poly.as_ptr()) };
        }
    }
}
