// SPDX-License-Identifier: Apache-2.0

//! Errors for the dataflow crate.

/// Errors that can occur while assembling a graph.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An edge or dependency names a node that was never added.
    #[error("Unknown node index {index}")]
    UnknownNode {
        /// The offending node index.
        index: usize,
    },

    /// A node was wired with a second outgoing edge.
    #[error("Node `{name}` already has an outgoing edge")]
    OutputAlreadyWired {
        /// Name of the offending node.
        name: String,
    },

    /// An edge or dependency was declared after the graph started; the
    /// shape is frozen from the first start on.
    #[error("The graph was already started")]
    AlreadyStarted,
}
