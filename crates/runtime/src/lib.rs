// SPDX-License-Identifier: Apache-2.0

//! Resource-centric cooperative task runtime.
//!
//! The engine runs short, non-blocking tasks to completion on a fixed pool
//! of worker threads, one pinned per configured CPU core. Shared objects —
//! *resources* — are addressed through a tagged pointer that carries, next
//! to the address, the worker the object is scheduled on and the
//! synchronization primitive that disciplines concurrent access. Depending
//! on that primitive, access is serialized by steering tasks to the home
//! worker, by an embedded latch, or by optimistic version validation backed
//! by epoch-based reclamation.
//!
//! Hot data paths are fully contained within each worker: a worker pops
//! from queues only it writes, allocates from its own heap, and steals from
//! NUMA-local victims only when idle. Inter-worker communication is
//! restricted to lock-free queue pushes.
//!
//! The entry point is [`Runtime::start`]; inside a task, the
//! [`TaskContext`] hands out spawning, resource construction and
//! allocation, all bound to the executing worker.

/// Errors for the runtime crate.
pub mod error;
pub mod prefetch;
pub mod profiling;
pub mod resource;
pub mod runtime;
pub mod scheduler;
pub mod squad;
pub mod sync;
pub mod task;
pub mod worker;

pub use error::Error;
pub use prefetch::PrefetchDescriptor;
pub use profiling::{Counter, CounterSnapshot};
pub use resource::annotation::{AccessFrequency, ReadWriteRatio, ResourceAnnotation};
pub use resource::ptr::ResourcePtr;
pub use runtime::Runtime;
pub use scheduler::{Scheduler, TaskContext, WorkerState};
pub use squad::Squad;
pub use sync::primitive::{IsolationLevel, Primitive, Protocol};
pub use task::{
    AccessIntention, Annotation, LambdaTask, Target, Task, TaskRef, TaskResult,
};
