// SPDX-License-Identifier: Apache-2.0

//! Squads: scheduler-managed FIFOs of deferred tasks bound to one worker.
//!
//! A squad keeps small units of work together without bouncing each one
//! through the main queues. It is built as a `ScheduleAll` resource, so
//! every access runs on the home worker and the plain `RefCell` inside is
//! safe by scheduling discipline.

use crate::scheduler::TaskContext;
use crate::task::TaskRef;
use std::cell::RefCell;
use std::collections::VecDeque;

/// A FIFO of deferred tasks bound to one worker.
pub struct Squad {
    pending: RefCell<VecDeque<TaskRef>>,
}

impl Squad {
    /// Creates an empty squad.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: RefCell::new(VecDeque::new()),
        }
    }

    /// Number of deferred tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// True when nothing is deferred.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    /// Defers a task. The squad owns it until it is flushed.
    pub fn defer(&self, task: TaskRef) {
        self.pending.borrow_mut().push_back(task);
    }

    /// Spawns every deferred task in FIFO order.
    pub fn flush(&self, ctx: &TaskContext<'_>) {
        let mut pending = self.pending.borrow_mut();
        while let Some(task) = pending.pop_front() {
            ctx.spawn(task);
        }
    }
}

impl Default for Squad {
    fn default() -> Self {
        Self::new()
    }
}
