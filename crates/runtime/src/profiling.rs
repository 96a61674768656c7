// SPDX-License-Identifier: Apache-2.0

//! Per-worker task counters.
//!
//! Counting is off unless the `task_counter` knob is set; the disabled
//! path is a branch on a bool, not an atomic.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};
use taskmill_config::WorkerId;

/// The counters the runtime maintains per worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    /// Tasks handed to `spawn`.
    Dispatched = 0,
    /// Spawns that landed in the spawning worker's own queues.
    DispatchedLocally = 1,
    /// Spawns that crossed to another worker's queue.
    DispatchedRemotely = 2,
    /// Tasks executed.
    Executed = 3,
    /// Executed tasks that declared read intention.
    ExecutedReader = 4,
    /// Executed tasks that declared write intention.
    ExecutedWriter = 5,
    /// Tasks obtained by stealing from a victim.
    Stolen = 6,
    /// Prefetch descriptors issued.
    Prefetched = 7,
}

const COUNTERS: usize = 8;

/// All counters of all workers.
pub struct TaskCounters {
    enabled: bool,
    cells: Box<[CachePadded<[AtomicU64; COUNTERS]>]>,
}

impl TaskCounters {
    /// Creates counters for `workers` workers.
    #[must_use]
    pub fn new(workers: usize, enabled: bool) -> Self {
        Self {
            enabled,
            cells: (0..workers)
                .map(|_| CachePadded::new(std::array::from_fn(|_| AtomicU64::new(0))))
                .collect(),
        }
    }

    /// True when counting is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Bumps one counter of one worker.
    #[inline]
    pub fn increment(&self, worker_id: WorkerId, counter: Counter) {
        if self.enabled {
            let _ = self.cells[usize::from(worker_id)][counter as usize]
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reads one counter of one worker.
    #[must_use]
    pub fn get(&self, worker_id: WorkerId, counter: Counter) -> u64 {
        self.cells[usize::from(worker_id)][counter as usize].load(Ordering::Relaxed)
    }

    /// Snapshots every counter.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            per_worker: self
                .cells
                .iter()
                .map(|cell| std::array::from_fn(|i| cell[i].load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// A point-in-time copy of all counters.
#[derive(Debug, Clone)]
pub struct CounterSnapshot {
    per_worker: Vec<[u64; COUNTERS]>,
}

impl CounterSnapshot {
    /// One worker's value of one counter.
    #[must_use]
    pub fn get(&self, worker_id: WorkerId, counter: Counter) -> u64 {
        self.per_worker[usize::from(worker_id)][counter as usize]
    }

    /// Sum of one counter over all workers.
    #[must_use]
    pub fn total(&self, counter: Counter) -> u64 {
        self.per_worker
            .iter()
            .map(|counters| counters[counter as usize])
            .sum()
    }
}
