// SPDX-License-Identifier: Apache-2.0

//! Dataflow graphs over the taskmill runtime.
//!
//! A graph is a set of nodes that produce and consume tokens. Edges route
//! every token a node emits to its successor; nodes are grouped into
//! pipelines, and dependencies between pipelines gate when a pipeline's
//! source starts producing. When the inputs of a node complete, a
//! finalization barrier runs behind the node's in-flight work, after which
//! the node finalizes sequentially, in parallel over its finalize
//! sequence, or as a home-preserving reduce tournament.

pub mod annotation;
/// Errors for the dataflow crate.
pub mod error;
pub mod graph;
pub mod node;
pub mod pipeline;
pub mod token;

pub use annotation::{CompletionCallback, FinalizationType, NodeAnnotation, TokenGenerator};
pub use error::Error;
pub use graph::{Emitter, Graph};
pub use node::{EmptyNode, FnNode, Node, NodeId};
pub use pipeline::PipelineId;
pub use token::Token;
