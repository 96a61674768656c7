// SPDX-License-Identifier: Apache-2.0

//! Errors for the allocator crate.

use taskmill_config::NumaNodeId;

/// Errors that can occur while mapping, binding, or releasing block memory.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Mapping anonymous memory from the OS failed.
    #[error("Failed to map a {size} byte block from the OS: {errno}")]
    Map {
        /// Requested mapping size in bytes.
        size: usize,
        /// OS error code.
        errno: i32,
    },

    /// Binding a fresh block to the requested NUMA node was rejected by the
    /// kernel. The allocation is not silently served from another node.
    #[error("Failed to bind a {size} byte block to NUMA node {numa_node_id}: {errno}")]
    NumaBind {
        /// Requested mapping size in bytes.
        size: usize,
        /// The node the block was meant to live on.
        numa_node_id: NumaNodeId,
        /// OS error code.
        errno: i32,
    },

    /// Unmapping a block failed.
    #[error("Failed to unmap a {size} byte block: {errno}")]
    Unmap {
        /// Mapping size in bytes.
        size: usize,
        /// OS error code.
        errno: i32,
    },
}
