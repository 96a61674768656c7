// SPDX-License-Identifier: Apache-2.0

//! Node identities and the node behavior trait.

use crate::graph::Emitter;
use crate::token::Token;
use std::fmt;
use taskmill_runtime::{ResourcePtr, TaskContext};

/// Identifies a node in its graph: a dense index plus a display name.
#[derive(Clone, Debug)]
pub struct NodeId {
    pub(crate) index: usize,
    /// Display name, as reported by the node itself.
    pub name: String,
}

impl NodeId {
    /// The dense index of the node within its graph.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialEq for NodeId {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for NodeId {}

/// Behavior of a graph node.
///
/// `consume` is invoked once per token, potentially concurrently on many
/// workers; node state must live in resources or behind interior
/// mutability that matches the tokens' scheduling annotations.
pub trait Node<T: Send + 'static>: Send + Sync + 'static {
    /// Consumes one token; may emit follow-up tokens through the emitter.
    fn consume(&self, ctx: &TaskContext<'_>, emitter: &Emitter<'_, T>, token: Token<T>);

    /// Called when one of the node's inputs completed.
    fn in_completed(&self, _ctx: &TaskContext<'_>, _emitter: &Emitter<'_, T>, _in_node: &NodeId) {}

    /// Called by the finalization machinery; `data` and `reduced` carry
    /// the finalize-sequence resources for parallel and reduce shapes and
    /// are null otherwise.
    fn finalize(
        &self,
        _ctx: &TaskContext<'_>,
        _emitter: &Emitter<'_, T>,
        _is_last: bool,
        _data: ResourcePtr,
        _reduced: ResourcePtr,
    ) {
    }

    /// Display name of the node.
    fn name(&self) -> String {
        "node".to_owned()
    }

    /// Optional trace id, forwarded to the tasks this node spawns.
    fn trace_id(&self) -> Option<u64> {
        None
    }
}

/// A node whose consume is a closure; enough for map-style operators.
pub struct FnNode<T, F>
where
    T: Send + 'static,
    F: Fn(&TaskContext<'_>, &Emitter<'_, T>, Token<T>) + Send + Sync + 'static,
{
    name: String,
    consume: F,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, F> FnNode<T, F>
where
    T: Send + 'static,
    F: Fn(&TaskContext<'_>, &Emitter<'_, T>, Token<T>) + Send + Sync + 'static,
{
    /// Wraps a closure as a node.
    pub fn new(name: impl Into<String>, consume: F) -> Self {
        Self {
            name: name.into(),
            consume,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, F> Node<T> for FnNode<T, F>
where
    T: Send + 'static,
    F: Fn(&TaskContext<'_>, &Emitter<'_, T>, Token<T>) + Send + Sync + 'static,
{
    fn consume(&self, ctx: &TaskContext<'_>, emitter: &Emitter<'_, T>, token: Token<T>) {
        (self.consume)(ctx, emitter, token);
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// A node that forwards nothing and simply completes; useful to shape
/// dependencies.
pub struct EmptyNode;

impl<T: Send + 'static> Node<T> for EmptyNode {
    fn consume(&self, _ctx: &TaskContext<'_>, _emitter: &Emitter<'_, T>, _token: Token<T>) {}

    fn name(&self) -> String {
        "empty".to_owned()
    }
}
