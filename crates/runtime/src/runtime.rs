// SPDX-License-Identifier: Apache-2.0

//! The engine handle: starts the pinned worker pool, spawns work from the
//! outside, and tears everything down.

use crate::error::Error;
use crate::profiling::CounterSnapshot;
use crate::scheduler::Scheduler;
use crate::task::{LambdaTask, Task, TaskRef, TaskResult};
use crate::worker::Worker;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::Arc;
use std::thread::JoinHandle;
use taskmill_config::{RuntimeConfig, WorkerId};

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

pub(crate) fn set_current_worker(worker_id: WorkerId) {
    CURRENT_WORKER.with(|cell| cell.set(Some(worker_id)));
}

/// A running engine instance.
///
/// One `Runtime` owns the worker pool, the allocator, the epoch manager
/// and the resource builder. Tasks must not outlive it; dropping the
/// handle stops the engine and joins every worker.
pub struct Runtime {
    scheduler: Arc<Scheduler>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Validates the configuration, spawns one pinned worker per core and
    /// returns the handle.
    pub fn start(config: RuntimeConfig) -> Result<Runtime, Error> {
        config.validate()?;
        tracing::info!(
            workers = config.cores.len(),
            prefetch = ?config.prefetch,
            "starting runtime"
        );

        let (scheduler, deques) = Scheduler::new(&config);
        let scheduler = Arc::new(scheduler);
        let mut threads = Vec::with_capacity(deques.len());

        for (worker_id, deque) in deques.into_iter().enumerate() {
            let Some(descriptor) = config.cores.get(worker_id) else {
                continue;
            };
            let thread_name = format!("taskmill-worker-{worker_id}");
            let scheduler_for_thread = Arc::clone(&scheduler);

            let spawned = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    let id = worker_id as WorkerId;
                    let pinned = core_affinity::set_for_current(core_affinity::CoreId {
                        id: usize::from(descriptor.cpu_id),
                    });
                    if !pinned {
                        tracing::warn!(
                            worker_id = id,
                            cpu_id = descriptor.cpu_id,
                            "failed to pin worker to its core"
                        );
                    }
                    set_current_worker(id);
                    // Safety: owner contract — this thread is the worker.
                    unsafe {
                        scheduler_for_thread.allocator().initialize_worker_heap(id);
                    }
                    Worker::new(scheduler_for_thread, id, deque).run();
                });

            match spawned {
                Ok(handle) => threads.push(handle),
                Err(source) => {
                    // Roll the partially started pool back.
                    scheduler.request_stop(0, true);
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(Error::ThreadSpawnError {
                        thread_name,
                        source,
                    });
                }
            }
        }

        Ok(Runtime {
            scheduler,
            threads: Mutex::new(threads),
        })
    }

    /// The scheduler backing this runtime.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Number of workers.
    #[must_use]
    pub fn workers(&self) -> u16 {
        self.scheduler.workers()
    }

    /// True while the worker pool is up and no stop was requested.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.scheduler.is_stopping() && self.scheduler.active_workers() > 0
    }

    /// The worker id of the calling thread, when it is one of this
    /// process's engine workers.
    #[must_use]
    pub fn worker_id_of_calling_thread() -> Option<WorkerId> {
        CURRENT_WORKER.with(Cell::get)
    }

    /// Creates a task with the global allocator, for spawning from threads
    /// outside the pool. Workers create tasks through their
    /// [`crate::TaskContext`] instead.
    pub fn new_task<T: Task>(&self, task: T) -> TaskRef {
        self.scheduler.new_task_external(task)
    }

    /// Creates a closure task with the global allocator.
    pub fn new_lambda_task<F>(&self, body: F) -> TaskRef
    where
        F: FnMut(&crate::TaskContext<'_>) -> TaskResult + Send + 'static,
    {
        self.new_task(LambdaTask::new(body))
    }

    /// Schedules a task according to its annotation. `caller_worker`
    /// attributes the dispatch in the counters; pass 0 from non-worker
    /// threads.
    pub fn spawn(&self, task: TaskRef, caller_worker: WorkerId) {
        self.scheduler.spawn_with(task, caller_worker, None);
    }

    /// Deletes a task that was never spawned, from outside the pool.
    ///
    /// # Safety
    /// The caller must own the task exclusively.
    pub unsafe fn delete_task(&self, task: TaskRef) {
        // Safety: forwarded contract; external path frees through the
        // queue, never into a live worker heap.
        unsafe {
            task.drop_payload();
            if task.is_external() {
                std::alloc::dealloc(task.as_raw().as_ptr().cast(), task.dealloc_layout());
            } else {
                self.scheduler.allocator().free_anywhere(task.as_raw().cast());
            }
        }
    }

    /// Requests a stop and joins every worker. Idempotent.
    pub fn stop(&self) {
        self.scheduler.request_stop(0, false);
        self.join();
    }

    /// Joins every worker without requesting a stop: returns once a task
    /// reported [`TaskResult::Stop`] and the pool wound down.
    pub fn wait(&self) {
        self.join();
    }

    /// A snapshot of the per-worker task counters.
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.scheduler.task_counters().snapshot()
    }

    fn join(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut threads = self.threads.lock();
            threads.drain(..).collect()
        };
        for handle in handles {
            let thread_name = handle
                .thread()
                .name()
                .unwrap_or("taskmill-worker")
                .to_owned();
            if let Err(panic) = handle.join() {
                let error = Error::WorkerPanic {
                    thread_name,
                    panic_message: format!("{panic:?}"),
                };
                tracing::error!(%error, "worker thread panicked");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}
