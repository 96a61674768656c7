// SPDX-License-Identifier: Apache-2.0

//! Per-node annotations: production mode, finalization shape, completion
//! callbacks.

use crate::token::Token;
use taskmill_config::WorkerId;
use taskmill_runtime::ResourcePtr;

/// How a node is finalized once its inputs completed and its in-flight
/// tasks drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalizationType {
    /// One finalize task on worker 0.
    #[default]
    Sequential,
    /// One finalize task per resource in the finalize sequence; the last
    /// one completes the node.
    Parallel,
    /// Pairwise tournament over the finalize sequence; the surviving
    /// resource runs the sequential finish.
    Reduce,
    /// Complete immediately after the barrier.
    None,
}

/// Produces the tokens of a source node.
///
/// For a parallel source, every worker calls [`TokenGenerator::generate`]
/// with its own id and receives its NUMA-local shard of tokens.
pub trait TokenGenerator<T>: Send + Sync + 'static {
    /// The tokens this worker should produce.
    fn generate(&self, worker_id: WorkerId) -> Vec<Token<T>>;
}

/// Decides whether a node that spawns further work during finalization has
/// really completed.
pub trait CompletionCallback: Send + Sync + 'static {
    /// True when the node is complete; checked after each parallel
    /// finalization wave.
    fn is_complete(&self) -> bool;
}

/// The full annotation of a graph node.
pub struct NodeAnnotation<T> {
    is_parallel: bool,
    token_generator: Option<Box<dyn TokenGenerator<T>>>,
    finalization_type: FinalizationType,
    finalize_sequence: Vec<ResourcePtr>,
    finalizes_pipeline: bool,
    completion_callback: Option<Box<dyn CompletionCallback>>,
}

impl<T> Default for NodeAnnotation<T> {
    fn default() -> Self {
        Self {
            is_parallel: false,
            token_generator: None,
            finalization_type: FinalizationType::default(),
            finalize_sequence: Vec::new(),
            finalizes_pipeline: false,
            completion_callback: None,
        }
    }
}

impl<T> NodeAnnotation<T> {
    /// A neutral annotation: sequential, non-producing, sequential
    /// finalization.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the node's production as parallel (a spawner per worker).
    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.is_parallel = true;
        self
    }

    /// Installs the token generator that makes this node a source.
    #[must_use]
    pub fn produces(mut self, generator: impl TokenGenerator<T>) -> Self {
        self.token_generator = Some(Box::new(generator));
        self
    }

    /// Sets the finalization shape.
    #[must_use]
    pub fn finalization(mut self, finalization_type: FinalizationType) -> Self {
        self.finalization_type = finalization_type;
        self
    }

    /// Sets the resources a parallel or reduce finalization runs over.
    #[must_use]
    pub fn finalizes(mut self, resources: Vec<ResourcePtr>) -> Self {
        self.finalize_sequence = resources;
        self
    }

    /// Completing this node completes its pipeline even when it is not the
    /// topologically last node.
    #[must_use]
    pub fn finalizes_pipeline(mut self) -> Self {
        self.finalizes_pipeline = true;
        self
    }

    /// Installs a completion callback consulted by parallel finalization.
    #[must_use]
    pub fn completion(mut self, callback: impl CompletionCallback) -> Self {
        self.completion_callback = Some(Box::new(callback));
        self
    }

    /// True when production fans out over all workers.
    #[must_use]
    pub fn is_parallel(&self) -> bool {
        self.is_parallel
    }

    /// True when the node produces tokens by itself.
    #[must_use]
    pub fn is_producing(&self) -> bool {
        self.token_generator.is_some()
    }

    /// The token generator, if any.
    #[must_use]
    pub fn token_generator(&self) -> Option<&dyn TokenGenerator<T>> {
        self.token_generator.as_deref()
    }

    /// The finalization shape.
    #[must_use]
    pub fn finalization_type(&self) -> FinalizationType {
        self.finalization_type
    }

    /// The finalize sequence.
    #[must_use]
    pub fn finalize_sequence(&self) -> &[ResourcePtr] {
        &self.finalize_sequence
    }

    /// True when this node completes its pipeline prematurely.
    #[must_use]
    pub fn is_finalizes_pipeline(&self) -> bool {
        self.finalizes_pipeline
    }

    /// The completion callback, if any.
    #[must_use]
    pub fn completion_callback(&self) -> Option<&dyn CompletionCallback> {
        self.completion_callback.as_deref()
    }
}
