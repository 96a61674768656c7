// SPDX-License-Identifier: Apache-2.0

//! Software prefetching of upcoming tasks' resources.
//!
//! Before executing a task, the worker peeks `k` tasks ahead in its own
//! queue and issues cache-line prefetches over the resource the peeked
//! task declares. The distance `k` is fixed or derived from the queue
//! length, depending on the configured [`PrefetchMode`].

use crate::resource::ptr::ResourcePtr;
use taskmill_config::PrefetchMode;

/// What to prefetch for one task: a resource and how many bytes of it.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchDescriptor {
    /// The resource whose memory the task will touch.
    pub resource: ResourcePtr,
    /// Number of bytes to cover, starting at the resource address.
    pub size: u32,
}

impl PrefetchDescriptor {
    /// Describes the first `size` bytes of a resource.
    #[must_use]
    pub fn new(resource: ResourcePtr, size: u32) -> Self {
        Self { resource, size }
    }
}

/// Issues prefetches over every cache line of the descriptor's range.
pub fn issue(descriptor: &PrefetchDescriptor) {
    let base = descriptor.resource.get::<u8>();
    if base.is_null() {
        return;
    }
    let mut offset = 0usize;
    while offset < descriptor.size as usize {
        // Safety (x86_64 path): prefetch never faults, any address is fine.
        #[cfg(target_arch = "x86_64")]
        unsafe {
            use std::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
            _mm_prefetch(base.add(offset).cast::<i8>(), _MM_HINT_T0);
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            // No portable prefetch intrinsic; fall back to a no-op.
            let _ = unsafe { base.add(offset) };
        }
        offset += 64;
    }
}

/// Resolves the lookahead distance for the current queue length.
///
/// The automatic mode is a software stand-in for a stall-cycle counter:
/// the deeper the queue, the further ahead it pays to prefetch, clamped to
/// the configured maximum and to the queue itself.
#[must_use]
pub fn distance(mode: PrefetchMode, queue_length: usize) -> usize {
    match mode {
        PrefetchMode::Disabled => 0,
        PrefetchMode::Fixed(k) => usize::from(k).min(queue_length),
        PrefetchMode::Automatic { max_distance } => {
            (queue_length / 2).min(usize::from(max_distance)).min(queue_length)
        }
    }
}
