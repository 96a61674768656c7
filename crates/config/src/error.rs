// SPDX-License-Identifier: Apache-2.0

//! Errors for the configuration crate.

/// Errors raised while building or validating an engine configuration.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The core set contains no cores.
    #[error("The core set is empty; the engine needs at least one worker")]
    EmptyCoreSet,

    /// More workers were requested than the engine supports.
    #[error("Requested {requested} workers, the engine supports at most {limit}")]
    TooManyWorkers {
        /// Number of cores in the requested set.
        requested: usize,
        /// Compile-time worker limit.
        limit: usize,
    },

    /// A core descriptor names a NUMA node beyond the compile-time limit.
    #[error("NUMA node {numa_node_id} is out of range (limit {limit})")]
    NumaNodeOutOfRange {
        /// The offending node id.
        numa_node_id: u8,
        /// Compile-time NUMA node limit.
        limit: usize,
    },

    /// The allocator block size is unusable.
    #[error("Invalid allocator block size {size}")]
    InvalidBlockSize {
        /// The offending size in bytes.
        size: usize,
    },

    /// Enumerating the CPUs of this machine failed.
    #[error("Failed to get available CPU cores (core detection unavailable on this platform)")]
    CoreDetectionUnavailable,

    /// A requested logical CPU does not exist on this machine.
    #[error("CPU {cpu_id} is not available on this machine (available: {available:?})")]
    UnknownCpu {
        /// The requested logical CPU id.
        cpu_id: u16,
        /// The CPU ids that exist.
        available: Vec<usize>,
    },
}
