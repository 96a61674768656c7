// SPDX-License-Identifier: Apache-2.0

//! Worker-local dynamic allocation and epoch-based memory reclamation.
//!
//! Every worker owns a heap of large, NUMA-bound blocks and serves its own
//! allocations without synchronization. Frees from other workers travel
//! through lock-free MPSC queues and are folded back into the owning heap
//! lazily, so cross-worker contention is limited to a brief enqueue.
//!
//! Optimistically synchronized objects cannot be freed eagerly — a reader
//! may still hold the pointer. The [`reclamation`] module defers their
//! destruction until every worker has advanced past the epoch in which the
//! object was logically removed.

pub mod allocator;
pub mod block;
/// Errors for the allocator crate.
pub mod error;
pub mod header;
pub mod heap;
pub mod os;
pub mod reclamation;

pub use allocator::Allocator;
pub use error::Error;
pub use header::{ALLOCATION_HEADER_SIZE, AllocationHeader, FreeHeader};
pub use reclamation::{Epoch, EpochManager, GarbageNode, QUIESCENT};

/// Alignment every block and every resource allocation is padded to.
pub const CACHE_LINE_SIZE: usize = 64;

/// Rounds `value` up to the next multiple of `multiple`.
///
/// `multiple` must not be zero.
#[must_use]
pub const fn next_multiple(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}
