// SPDX-License-Identifier: Apache-2.0

//! Start-time configuration for the taskmill scheduling engine.
//!
//! This type of configuration is distinct from the work a job submits at
//! runtime: it pins down the shape of the engine before any worker thread is
//! spawned — which logical CPUs to occupy, how aggressively to prefetch the
//! data of upcoming tasks, and which bookkeeping facilities (task counters,
//! task traces, graph timings) are recorded.
//!
//! All types are plain data with [`serde`] support so that an embedding
//! binary can read them from a JSON file and hand them to
//! `taskmill_runtime::start` unchanged.

use serde::{Deserialize, Serialize};

pub mod core_set;
/// Errors for the configuration crate.
pub mod error;

pub use core_set::{CoreDescriptor, CoreOrder, CoreSet};
pub use error::Error;

/// Identifier of a worker: an index into the engine's core set.
pub type WorkerId = u16;

/// Identifier of a NUMA node.
pub type NumaNodeId = u8;

/// Upper bound on the number of workers a single engine instance may drive.
///
/// The worker id travels in a 12-bit field of the tagged resource pointer,
/// so this limit must never exceed `1 << 12`.
pub const MAX_WORKERS: usize = 1024;

/// Upper bound on the number of NUMA nodes the allocator keeps per-node
/// block lists and remote-free queues for. Must be a power of two.
pub const MAX_NUMA_NODES: usize = 8;

/// Default size of a block the worker-local allocator maps from the OS.
pub const DEFAULT_BLOCK_SIZE: usize = 128 * 1024 * 1024;

/// How a worker chooses the prefetch distance `k`: the number of queued
/// tasks it looks ahead when issuing software prefetches for the resource
/// of an upcoming task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchMode {
    /// No prefetching.
    #[default]
    Disabled,
    /// A fixed lookahead distance.
    Fixed(u16),
    /// The worker derives the distance from the length of its own task
    /// queue, clamped to the given maximum and re-sampled periodically.
    Automatic {
        /// Hard ceiling for the derived distance.
        max_distance: u16,
    },
}

impl PrefetchMode {
    /// True when any prefetching is performed at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, PrefetchMode::Disabled)
    }
}

/// Configuration handed to the runtime at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// The set of logical CPUs the engine occupies, one pinned worker each.
    pub cores: CoreSet,

    /// Prefetch behavior of every worker.
    #[serde(default)]
    pub prefetch: PrefetchMode,

    /// Record per-worker task counters (dispatched/executed/stolen/...).
    #[serde(default)]
    pub task_counter: bool,

    /// Emit a trace event per executed task that carries a trace id.
    #[serde(default)]
    pub task_trace: bool,

    /// Record pipeline start and node finish timestamps in dataflow graphs.
    #[serde(default)]
    pub graph_times: bool,

    /// Count per-node, per-worker `emit` calls in dataflow graphs.
    #[serde(default)]
    pub graph_emit_counter: bool,

    /// Size of the blocks the worker-local allocator maps from the OS.
    #[serde(default = "default_block_size")]
    pub allocator_block_size: usize,
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

impl RuntimeConfig {
    /// A configuration over the given core set with every optional facility
    /// turned off.
    #[must_use]
    pub fn new(cores: CoreSet) -> Self {
        Self {
            cores,
            prefetch: PrefetchMode::Disabled,
            task_counter: false,
            task_trace: false,
            graph_times: false,
            graph_emit_counter: false,
            allocator_block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Validates the cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        if self.cores.is_empty() {
            return Err(Error::EmptyCoreSet);
        }
        if self.cores.len() > MAX_WORKERS {
            return Err(Error::TooManyWorkers {
                requested: self.cores.len(),
                limit: MAX_WORKERS,
            });
        }
        if let Some(descriptor) = self
            .cores
            .iter()
            .find(|descriptor| usize::from(descriptor.numa_node_id) >= MAX_NUMA_NODES)
        {
            return Err(Error::NumaNodeOutOfRange {
                numa_node_id: descriptor.numa_node_id,
                limit: MAX_NUMA_NODES,
            });
        }
        if self.allocator_block_size == 0 {
            return Err(Error::InvalidBlockSize {
                size: self.allocator_block_size,
            });
        }
        Ok(())
    }
}

const _: () = assert!(MAX_WORKERS <= 1 << 12);
const _: () = assert!(MAX_NUMA_NODES.is_power_of_two());
