// SPDX-License-Identifier: Apache-2.0

//! The graph: nodes wired into pipelines, dependency-gated pipeline
//! startup, token routing, and the finalization machinery.
//!
//! Execution model: a pipeline starts by producing tokens from its source
//! node — in parallel (one spawner per worker, each generating a
//! NUMA-local shard) or sequentially on the starting worker. Each token is
//! consumed by the node that produced it; emitted tokens travel the out
//! edge as freshly spawned tasks. When a node's inputs have all completed,
//! a barrier task per worker runs behind the node's queued work; once the
//! barrier has passed *and* the node's in-flight consume tasks have
//! drained, the node finalizes according to its annotation and its
//! completion cascades downstream.

use crate::annotation::{FinalizationType, NodeAnnotation};
use crate::error::Error;
use crate::node::{Node, NodeId};
use crate::pipeline::{Pipeline, PipelineId};
use crate::token::Token;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use taskmill_runtime::{
    Annotation, Primitive, ResourcePtr, Runtime, Target, Task, TaskContext, TaskRef, TaskResult,
};

struct NodeSlot<T: Send + 'static> {
    node: Box<dyn Node<T>>,
    name: String,
    annotation: NodeAnnotation<T>,
    out: Option<usize>,
    ins: Vec<usize>,
    /// Inputs that have not completed yet.
    pending_ins: AtomicIsize,
    /// Spawned but not yet finished consume tasks of this node.
    pending_consumes: AtomicIsize,
    /// Barrier tasks that have not run yet.
    pending_barriers: AtomicIsize,
    /// Producing tasks (plus one virtual token per spawner) still running.
    pending_producers: AtomicIsize,
    /// Pending parallel finalize (or completion) tasks.
    pending_finalizers: AtomicIsize,
    barrier_passed: AtomicBool,
    finalize_started: AtomicBool,
}

/// A dataflow graph over tokens of type `T`.
///
/// Build it mutably (`add`, `make_edge`, `make_dependency`), wrap it in an
/// [`Arc`], and kick it off with [`Graph::start`]. The graph is dropped
/// when the last task referencing it finishes and the embedder releases
/// its handle.
pub struct Graph<T: Send + 'static> {
    nodes: Vec<NodeSlot<T>>,
    pipelines: Vec<Pipeline>,
    node_pipeline: Vec<PipelineId>,
    /// Declared pipeline dependencies, fixed at build time.
    declared_dependencies: Vec<(PipelineId, PipelineId)>,
    /// Remaining dependencies per pipeline, consumed during execution.
    dependencies: Mutex<HashMap<PipelineId, Vec<PipelineId>>>,
    pipeline_finished: Vec<AtomicBool>,
    preparatory: Mutex<Vec<TaskRef>>,
    record_times: bool,
    count_emits: bool,
    pipeline_start_times: Mutex<HashMap<PipelineId, Instant>>,
    node_finish_times: Mutex<HashMap<usize, Instant>>,
    /// nodes × workers emit counters, sized at start.
    emit_counters: OnceLock<Box<[CachePadded<AtomicU64>]>>,
    workers: AtomicUsize,
    started: AtomicBool,
    is_active: AtomicBool,
    finished_pipelines: AtomicUsize,
    completed: Mutex<bool>,
    completed_signal: Condvar,
}

impl<T: Send + 'static> Default for Graph<T> {
    fn default() -> Self {
        Self::new(false, false)
    }
}

impl<T: Send + 'static> Graph<T> {
    /// Creates an empty graph. `record_times` enables pipeline/node
    /// timestamps; `count_emits` enables per-node emit counters.
    #[must_use]
    pub fn new(record_times: bool, count_emits: bool) -> Self {
        Self {
            nodes: Vec::new(),
            pipelines: Vec::new(),
            node_pipeline: Vec::new(),
            declared_dependencies: Vec::new(),
            dependencies: Mutex::new(HashMap::new()),
            pipeline_finished: Vec::new(),
            preparatory: Mutex::new(Vec::new()),
            record_times,
            count_emits,
            pipeline_start_times: Mutex::new(HashMap::new()),
            node_finish_times: Mutex::new(HashMap::new()),
            emit_counters: OnceLock::new(),
            workers: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            is_active: AtomicBool::new(true),
            finished_pipelines: AtomicUsize::new(0),
            completed: Mutex::new(false),
            completed_signal: Condvar::new(),
        }
    }

    /// Adds a node with its annotation; the node starts out in a pipeline
    /// of its own.
    pub fn add(&mut self, node: impl Node<T>, annotation: NodeAnnotation<T>) -> NodeId {
        let index = self.nodes.len();
        let name = node.name();
        self.nodes.push(NodeSlot {
            node: Box::new(node),
            name: name.clone(),
            annotation,
            out: None,
            ins: Vec::new(),
            pending_ins: AtomicIsize::new(0),
            pending_consumes: AtomicIsize::new(0),
            pending_barriers: AtomicIsize::new(0),
            pending_producers: AtomicIsize::new(0),
            pending_finalizers: AtomicIsize::new(0),
            barrier_passed: AtomicBool::new(false),
            finalize_started: AtomicBool::new(false),
        });

        let pipeline_id = self.pipelines.len();
        self.pipelines.push(Pipeline { nodes: vec![index] });
        self.pipeline_finished.push(AtomicBool::new(false));
        self.node_pipeline.push(pipeline_id);
        NodeId { index, name }
    }

    /// Connects `from` to `to`: every token `from` emits is consumed by
    /// `to`, and both nodes execute in the same pipeline.
    pub fn make_edge(&mut self, from: &NodeId, to: &NodeId) -> Result<(), Error> {
        self.ensure_not_started()?;
        let from_index = self.check_node(from)?;
        let to_index = self.check_node(to)?;
        if self.nodes[from_index].out.is_some() {
            return Err(Error::OutputAlreadyWired {
                name: self.nodes[from_index].name.clone(),
            });
        }
        self.nodes[from_index].out = Some(to_index);
        self.nodes[to_index].ins.push(from_index);

        // Merge the two pipelines; the emptied one stays as a husk so
        // pipeline ids remain stable.
        let from_pipeline = self.node_pipeline[from_index];
        let to_pipeline = self.node_pipeline[to_index];
        if from_pipeline != to_pipeline {
            let moved = std::mem::take(&mut self.pipelines[to_pipeline].nodes);
            for &node in &moved {
                self.node_pipeline[node] = from_pipeline;
            }
            self.pipelines[from_pipeline].nodes.extend(moved);
        }
        Ok(())
    }

    /// Declares that `node`'s pipeline may only start after
    /// `node_to_wait_for`'s pipeline finished. If both share a pipeline,
    /// the depended-on subgraph moves to a new pipeline.
    pub fn make_dependency(&mut self, node: &NodeId, node_to_wait_for: &NodeId) -> Result<(), Error> {
        self.ensure_not_started()?;
        let node_index = self.check_node(node)?;
        let waited_index = self.check_node(node_to_wait_for)?;

        let node_pipeline = self.node_pipeline[node_index];
        let waited_pipeline = self.node_pipeline[waited_index];

        if node_pipeline == waited_pipeline {
            // The dependency would cycle inside one pipeline; carve the
            // depended-on node and its predecessors out.
            let new_pipeline = self.pipelines.len();
            self.pipelines.push(Pipeline::default());
            self.pipeline_finished.push(AtomicBool::new(false));
            self.change_pipeline(waited_index, node_pipeline, new_pipeline);
            self.declared_dependencies.push((node_pipeline, new_pipeline));
        } else {
            self.declared_dependencies.push((node_pipeline, waited_pipeline));
        }
        Ok(())
    }

    fn change_pipeline(&mut self, node: usize, from: PipelineId, to: PipelineId) {
        if self.node_pipeline[node] != from {
            return;
        }
        self.node_pipeline[node] = to;
        self.pipelines[from].nodes.retain(|&n| n != node);
        self.pipelines[to].nodes.push(node);
        let ins = self.nodes[node].ins.clone();
        for in_node in ins {
            self.change_pipeline(in_node, from, to);
        }
    }

    /// Queues tasks that run before any pipeline starts.
    pub fn add_preparatory(&mut self, tasks: Vec<TaskRef>) {
        self.preparatory.lock().extend(tasks);
    }

    /// The display id of a node index.
    #[must_use]
    pub fn node_id(&self, index: usize) -> Option<NodeId> {
        self.nodes.get(index).map(|slot| NodeId {
            index,
            name: slot.name.clone(),
        })
    }

    /// The pipelines of the graph (husks from merges included).
    #[must_use]
    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    /// The pipeline a node belongs to.
    #[must_use]
    pub fn pipeline_of(&self, node: &NodeId) -> PipelineId {
        self.node_pipeline[node.index]
    }

    /// Stops token emission; in-flight tasks still run to completion.
    pub fn interrupt(&self) {
        self.is_active.store(false, Ordering::SeqCst);
        tracing::debug!("graph interrupted");
    }

    /// True once every pipeline finished.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        *self.completed.lock()
    }

    /// Blocks until every pipeline finished.
    pub fn wait(&self) {
        let mut completed = self.completed.lock();
        while !*completed {
            self.completed_signal.wait(&mut completed);
        }
    }

    /// Start timestamp of a pipeline (requires `record_times`).
    #[must_use]
    pub fn start_time(&self, pipeline: PipelineId) -> Option<Instant> {
        self.pipeline_start_times.lock().get(&pipeline).copied()
    }

    /// Finish timestamp of a node (requires `record_times`).
    #[must_use]
    pub fn finish_time(&self, node: &NodeId) -> Option<Instant> {
        self.node_finish_times.lock().get(&node.index).copied()
    }

    /// Per-node wall-clock durations along each pipeline, in pipeline
    /// order (requires `record_times`).
    #[must_use]
    pub fn node_times(&self) -> Vec<(NodeId, Duration)> {
        let starts = self.pipeline_start_times.lock();
        let finishes = self.node_finish_times.lock();
        let mut times = Vec::new();
        for (pipeline_id, pipeline) in self.pipelines.iter().enumerate() {
            let Some(&start) = starts.get(&pipeline_id) else {
                continue;
            };
            let mut last = start;
            for &node in &pipeline.nodes {
                if let Some(&finish) = finishes.get(&node) {
                    let id = NodeId {
                        index: node,
                        name: self.nodes[node].name.clone(),
                    };
                    times.push((id, finish.duration_since(last)));
                    last = finish;
                }
            }
        }
        times
    }

    /// Total emit calls of a node over all workers (requires
    /// `count_emits`).
    #[must_use]
    pub fn count_emitted(&self, node: &NodeId) -> u64 {
        let Some(counters) = self.emit_counters.get() else {
            return 0;
        };
        let workers = self.workers.load(Ordering::Relaxed);
        (0..workers)
            .map(|worker| counters[node.index * workers + worker].load(Ordering::Relaxed))
            .sum()
    }

    fn check_node(&self, node: &NodeId) -> Result<usize, Error> {
        if node.index < self.nodes.len() {
            Ok(node.index)
        } else {
            Err(Error::UnknownNode { index: node.index })
        }
    }

    fn ensure_not_started(&self) -> Result<(), Error> {
        if self.started.load(Ordering::SeqCst) {
            Err(Error::AlreadyStarted)
        } else {
            Ok(())
        }
    }

    fn active_pipelines(&self) -> usize {
        self.pipelines
            .iter()
            .filter(|pipeline| !pipeline.nodes.is_empty())
            .count()
    }

    // ----- execution -------------------------------------------------

    /// Starts the graph: spawns a kickoff task on `worker_id` which runs
    /// the preparatory tasks and every pipeline without dependencies.
    pub fn start(graph: &Arc<Self>, runtime: &Runtime, worker_id: u16) {
        let clone = Arc::clone(graph);
        let kickoff = runtime.new_lambda_task(move |ctx| {
            Graph::start_in(&clone, ctx);
            TaskResult::Remove
        });
        kickoff.annotate(Target::Worker(worker_id));
        runtime.spawn(kickoff, worker_id);
    }

    /// Starts the graph from inside a task, on the executing worker. The
    /// shape is frozen from here on; a second start is ignored.
    pub fn start_in(graph: &Arc<Self>, ctx: &TaskContext<'_>) {
        if graph.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("graph started twice; ignoring");
            return;
        }
        let workers = usize::from(ctx.workers());
        graph.workers.store(workers, Ordering::SeqCst);
        if graph.count_emits {
            let _ = graph.emit_counters.set(
                (0..graph.nodes.len() * workers)
                    .map(|_| CachePadded::new(AtomicU64::new(0)))
                    .collect(),
            );
        }
        for slot in &graph.nodes {
            slot.pending_ins
                .store(slot.ins.len() as isize, Ordering::SeqCst);
        }

        for task in graph.preparatory.lock().drain(..) {
            ctx.spawn(task);
        }

        // Seed the dependency table and start every free pipeline.
        let startable: Vec<PipelineId> = {
            let mut dependencies = graph.dependencies.lock();
            for (pipeline_id, pipeline) in graph.pipelines.iter().enumerate() {
                if !pipeline.nodes.is_empty() {
                    let _ = dependencies.entry(pipeline_id).or_default();
                }
            }
            for &(waiter, waited_on) in &graph.declared_dependencies {
                dependencies.entry(waiter).or_default().push(waited_on);
            }
            let startable = dependencies
                .iter()
                .filter(|(_, waits)| waits.is_empty())
                .map(|(&pipeline, _)| pipeline)
                .collect::<Vec<_>>();
            for pipeline in &startable {
                let _ = dependencies.remove(pipeline);
            }
            startable
        };

        for pipeline in startable {
            Graph::start_pipeline(graph, ctx, pipeline);
        }
    }

    fn start_pipeline(graph: &Arc<Self>, ctx: &TaskContext<'_>, pipeline: PipelineId) {
        if graph.record_times {
            let _ = graph
                .pipeline_start_times
                .lock()
                .insert(pipeline, Instant::now());
        }
        tracing::debug!(pipeline, "pipeline started");

        let Some(&source) = graph.pipelines[pipeline].nodes.first() else {
            return;
        };
        let slot = &graph.nodes[source];

        if slot.annotation.is_producing() && slot.annotation.is_parallel() {
            // One spawner per worker; each spawner carries one virtual
            // token so the counter cannot hit zero early.
            let workers = graph.workers.load(Ordering::SeqCst);
            slot.pending_producers
                .store(workers as isize, Ordering::SeqCst);
            for worker in 0..workers {
                let task = ctx.new_task(SpawnProducerTask {
                    graph: Arc::clone(graph),
                    node: source,
                });
                task.annotate(Target::Worker(worker as u16));
                ctx.spawn(task);
            }
        } else if slot.annotation.is_producing() {
            slot.pending_producers.store(1, Ordering::SeqCst);
            let task = ctx.new_task(SequentialProducerTask {
                graph: Arc::clone(graph),
                node: source,
            });
            ctx.spawn(task);
        } else if slot.ins.is_empty() {
            // An isolated, non-producing source completes right away.
            Graph::run_finalization(graph, ctx, source);
        } else {
            // The source consumes tokens from another pipeline; its
            // barrier-and-drain accounting decides when it finalizes.
            Graph::maybe_finalize(graph, ctx, source);
        }
    }

    /// Routes a token emitted by `from` to its successor by spawning a
    /// consume task annotated like the token.
    fn emit(graph: &Arc<Self>, ctx: &TaskContext<'_>, from: usize, token: Token<T>) {
        if !graph.is_active.load(Ordering::Relaxed) {
            return;
        }
        if let Some(counters) = graph.emit_counters.get() {
            let workers = graph.workers.load(Ordering::Relaxed);
            let _ = counters[from * workers + usize::from(ctx.worker_id())]
                .fetch_add(1, Ordering::Relaxed);
        }

        let Some(successor) = graph.nodes[from].out else {
            return;
        };
        let _ = graph.nodes[successor]
            .pending_consumes
            .fetch_add(1, Ordering::SeqCst);

        let (data, annotation) = token.into_parts();
        let task = ctx.new_task(ConsumeTask {
            graph: Arc::clone(graph),
            node: successor,
            payload: Some(data),
            annotation,
        });
        task.annotate(annotation);
        ctx.spawn(task);
    }

    fn producer_tick(graph: &Arc<Self>, ctx: &TaskContext<'_>, node: usize) {
        if graph.nodes[node].pending_producers.fetch_sub(1, Ordering::SeqCst) == 1 {
            Graph::run_finalization(graph, ctx, node);
        }
    }

    fn consume_tick(graph: &Arc<Self>, ctx: &TaskContext<'_>, node: usize) {
        if graph.nodes[node].pending_consumes.fetch_sub(1, Ordering::SeqCst) == 1 {
            Graph::maybe_finalize(graph, ctx, node);
        }
    }

    /// Fires the node's finalization exactly once, after its barrier has
    /// passed and its in-flight consume tasks have drained.
    fn maybe_finalize(graph: &Arc<Self>, ctx: &TaskContext<'_>, node: usize) {
        let slot = &graph.nodes[node];
        if slot.barrier_passed.load(Ordering::SeqCst)
            && slot.pending_consumes.load(Ordering::SeqCst) == 0
            && !slot.finalize_started.swap(true, Ordering::SeqCst)
        {
            Graph::run_finalization_guarded(graph, ctx, node);
        }
    }

    fn run_finalization(graph: &Arc<Self>, ctx: &TaskContext<'_>, node: usize) {
        if graph.nodes[node].finalize_started.swap(true, Ordering::SeqCst) {
            return;
        }
        Graph::run_finalization_guarded(graph, ctx, node);
    }

    fn run_finalization_guarded(graph: &Arc<Self>, ctx: &TaskContext<'_>, node: usize) {
        let slot = &graph.nodes[node];
        match slot.annotation.finalization_type() {
            FinalizationType::None => {
                let emitter = Emitter {
                    graph,
                    from: node,
                };
                slot.node
                    .finalize(ctx, &emitter, true, ResourcePtr::null(), ResourcePtr::null());
                Graph::complete(graph, ctx, node);
            }
            FinalizationType::Sequential => {
                let task = ctx.new_task(SequentialFinalizeTask {
                    graph: Arc::clone(graph),
                    node,
                    data: ResourcePtr::null(),
                });
                task.annotate(Target::Worker(0));
                ctx.spawn(task);
            }
            FinalizationType::Parallel => {
                let sequence = slot.annotation.finalize_sequence().to_vec();
                if sequence.is_empty() {
                    let emitter = Emitter { graph, from: node };
                    slot.node.finalize(
                        ctx,
                        &emitter,
                        true,
                        ResourcePtr::null(),
                        ResourcePtr::null(),
                    );
                    Graph::complete(graph, ctx, node);
                    return;
                }
                slot.pending_finalizers
                    .store(sequence.len() as isize, Ordering::SeqCst);
                for resource in sequence {
                    let task = ctx.new_task(ParallelFinalizeTask {
                        graph: Arc::clone(graph),
                        node,
                        data: resource,
                    });
                    task.annotate(home_annotation(resource));
                    ctx.spawn(task);
                }
            }
            FinalizationType::Reduce => {
                Graph::start_reduce(graph, ctx, node);
            }
        }
    }

    /// Builds and launches the reduce tournament over the node's finalize
    /// sequence. Pairing halves the field each stage, and a resource's
    /// task always runs on that resource's home worker.
    fn start_reduce(graph: &Arc<Self>, ctx: &TaskContext<'_>, node: usize) {
        let sequence = graph.nodes[node].annotation.finalize_sequence().to_vec();

        let (stages, survivor) = reduce_pairs(&sequence);

        let final_task = ctx.new_task(SequentialFinalizeTask {
            graph: Arc::clone(graph),
            node,
            data: survivor,
        });
        if survivor.is_null() {
            final_task.annotate(Target::Worker(0));
        } else {
            final_task.annotate(home_annotation(survivor));
        }
        if stages.is_empty() {
            ctx.spawn(final_task);
            return;
        }

        // Wire every reduce step to the next step its surviving resource
        // participates in; steps with no predecessor spawn immediately.
        let mut steps = Vec::new();
        for stage in &stages {
            for &(main, partner) in stage {
                steps.push(ReduceStep {
                    main,
                    partner,
                    follow_up: None,
                    pending: AtomicIsize::new(0),
                });
            }
        }
        let mut latest: HashMap<u64, usize> = HashMap::new();
        for index in 0..steps.len() {
            for participant in [steps[index].main, steps[index].partner] {
                if let Some(&previous) = latest.get(&participant.to_word()) {
                    steps[previous].follow_up = Some(ReduceFollowUp::Step(index));
                    let _ = steps[index].pending.fetch_add(1, Ordering::Relaxed);
                }
            }
            let _ = latest.insert(steps[index].main.to_word(), index);
            let _ = latest.remove(&steps[index].partner.to_word());
        }
        if let Some(&last) = latest.get(&survivor.to_word()) {
            steps[last].follow_up = Some(ReduceFollowUp::Final);
        }

        let plan = Arc::new(ReducePlan {
            steps,
            tasks: OnceLock::new(),
            final_task,
        });

        let tasks: Vec<TaskRef> = (0..plan.steps.len())
            .map(|step| {
                let task = ctx.new_task(ReduceFinalizeTask {
                    graph: Arc::clone(graph),
                    node,
                    plan: Arc::clone(&plan),
                    step,
                });
                task.annotate(home_annotation(plan.steps[step].main));
                task
            })
            .collect();
        let roots: Vec<TaskRef> = plan
            .steps
            .iter()
            .zip(&tasks)
            .filter(|(step, _)| step.pending.load(Ordering::Relaxed) == 0)
            .map(|(_, &task)| task)
            .collect();
        let _ = plan.tasks.set(tasks);

        for task in roots {
            ctx.spawn(task);
        }
    }

    /// Runs after a node's finalization: timestamps, downstream input
    /// accounting, barrier installation, pipeline bookkeeping.
    fn complete(graph: &Arc<Self>, ctx: &TaskContext<'_>, node: usize) {
        if graph.record_times {
            let _ = graph.node_finish_times.lock().insert(node, Instant::now());
        }
        tracing::debug!(node = %graph.nodes[node].name, "node completed");

        let slot = &graph.nodes[node];
        let mut successor_pipeline = None;
        if let Some(successor) = slot.out {
            successor_pipeline = Some(graph.node_pipeline[successor]);
            let successor_slot = &graph.nodes[successor];
            let emitter = Emitter {
                graph,
                from: successor,
            };
            let in_id = NodeId {
                index: node,
                name: slot.name.clone(),
            };
            successor_slot.node.in_completed(ctx, &emitter, &in_id);

            if successor_slot.pending_ins.fetch_sub(1, Ordering::SeqCst) == 1 {
                // All inputs done: run a barrier behind the successor's
                // queued work on every worker.
                let workers = graph.workers.load(Ordering::SeqCst);
                successor_slot
                    .pending_barriers
                    .store(workers as isize, Ordering::SeqCst);
                for worker in 0..workers {
                    let task = ctx.new_task(BarrierTask {
                        graph: Arc::clone(graph),
                        node: successor,
                    });
                    task.annotate(Target::Worker(worker as u16));
                    ctx.spawn(task);
                }
            }
        }

        // Pipeline bookkeeping: this node ends its pipeline when it has no
        // successor in the same pipeline or finalizes it prematurely.
        let pipeline = graph.node_pipeline[node];
        let ends_pipeline = successor_pipeline != Some(pipeline)
            || slot.annotation.is_finalizes_pipeline();
        if ends_pipeline {
            Graph::finish_pipeline(graph, ctx, pipeline);
        }
    }

    fn finish_pipeline(graph: &Arc<Self>, ctx: &TaskContext<'_>, pipeline: PipelineId) {
        if graph.pipeline_finished[pipeline].swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(pipeline, "pipeline finished");

        // Unblock dependent pipelines.
        let startable: Vec<PipelineId> = {
            let mut dependencies = graph.dependencies.lock();
            for waits in dependencies.values_mut() {
                waits.retain(|&p| p != pipeline);
            }
            let startable = dependencies
                .iter()
                .filter(|(_, waits)| waits.is_empty())
                .map(|(&p, _)| p)
                .collect::<Vec<_>>();
            for p in &startable {
                let _ = dependencies.remove(p);
            }
            startable
        };
        for p in startable {
            Graph::start_pipeline(graph, ctx, p);
        }

        let finished = graph.finished_pipelines.fetch_add(1, Ordering::SeqCst) + 1;
        if finished == graph.active_pipelines() {
            let mut completed = graph.completed.lock();
            *completed = true;
            graph.completed_signal.notify_all();
            tracing::debug!("graph completed");
        }
    }
}

/// Annotation that steers a task to a resource's home worker with
/// queue-serialized access.
fn home_annotation(resource: ResourcePtr) -> Annotation {
    Target::Resource(resource.with_primitive(Primitive::ScheduleAll)).into()
}

/// Splits the resources into tournament stages: each stage reduces the
/// second element of every pair into the first; odd elements carry over.
/// Returns the stages and the surviving resource.
fn reduce_pairs(resources: &[ResourcePtr]) -> (Vec<Vec<(ResourcePtr, ResourcePtr)>>, ResourcePtr) {
    let mut stages = Vec::new();
    let mut remaining: Vec<ResourcePtr> = resources.to_vec();
    while remaining.len() > 1 {
        let mut pairs = Vec::with_capacity(remaining.len() / 2);
        let mut next = Vec::with_capacity(remaining.len() / 2 + 1);
        let chunks = remaining.chunks_exact(2);
        let carry = chunks.remainder().first().copied();
        for pair in chunks {
            pairs.push((pair[0], pair[1]));
            next.push(pair[0]);
        }
        if let Some(carry) = carry {
            next.push(carry);
        }
        stages.push(pairs);
        remaining = next;
    }
    (stages, remaining.first().copied().unwrap_or(ResourcePtr::null()))
}

/// The bound view of the graph a node sees: emission and interruption on
/// behalf of one node.
pub struct Emitter<'a, T: Send + 'static> {
    graph: &'a Arc<Graph<T>>,
    from: usize,
}

impl<T: Send + 'static> Emitter<'_, T> {
    /// Emits a token to the node's successor.
    pub fn emit(&self, ctx: &TaskContext<'_>, token: Token<T>) {
        Graph::emit(self.graph, ctx, self.from, token);
    }

    /// Stops all further emission in the graph.
    pub fn interrupt(&self) {
        self.graph.interrupt();
    }

    /// The id of the node this emitter is bound to.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        NodeId {
            index: self.from,
            name: self.graph.nodes[self.from].name.clone(),
        }
    }
}

// ----- tasks ----------------------------------------------------------

struct SpawnProducerTask<T: Send + 'static> {
    graph: Arc<Graph<T>>,
    node: usize,
}

impl<T: Send + 'static> Task for SpawnProducerTask<T> {
    fn execute(&mut self, ctx: &TaskContext<'_>) -> TaskResult {
        let graph = &self.graph;
        let slot = &graph.nodes[self.node];
        if let Some(generator) = slot.annotation.token_generator() {
            let tokens = generator.generate(ctx.worker_id());
            if !tokens.is_empty() {
                let _ = slot
                    .pending_producers
                    .fetch_add(tokens.len() as isize, Ordering::SeqCst);
                for token in tokens {
                    let (data, annotation) = token.into_parts();
                    let task = ctx.new_task(ProducerTask {
                        graph: Arc::clone(graph),
                        node: self.node,
                        payload: Some(data),
                        annotation,
                    });
                    task.annotate(annotation);
                    ctx.spawn(task);
                }
            }
        }
        // The spawner's own virtual token.
        Graph::producer_tick(graph, ctx, self.node);
        TaskResult::Remove
    }
}

struct ProducerTask<T: Send + 'static> {
    graph: Arc<Graph<T>>,
    node: usize,
    payload: Option<T>,
    annotation: Annotation,
}

impl<T: Send + 'static> Task for ProducerTask<T> {
    fn execute(&mut self, ctx: &TaskContext<'_>) -> TaskResult {
        if let Some(data) = self.payload.take() {
            let graph = &self.graph;
            let emitter = Emitter {
                graph,
                from: self.node,
            };
            graph.nodes[self.node].node.consume(
                ctx,
                &emitter,
                Token::with_annotation(data, self.annotation),
            );
        }
        Graph::producer_tick(&self.graph, ctx, self.node);
        TaskResult::Remove
    }
}

struct SequentialProducerTask<T: Send + 'static> {
    graph: Arc<Graph<T>>,
    node: usize,
}

impl<T: Send + 'static> Task for SequentialProducerTask<T> {
    fn execute(&mut self, ctx: &TaskContext<'_>) -> TaskResult {
        let graph = &self.graph;
        let slot = &graph.nodes[self.node];
        if let Some(generator) = slot.annotation.token_generator() {
            let emitter = Emitter {
                graph,
                from: self.node,
            };
            for token in generator.generate(ctx.worker_id()) {
                slot.node.consume(ctx, &emitter, token);
            }
        }
        Graph::producer_tick(graph, ctx, self.node);
        TaskResult::Remove
    }
}

struct ConsumeTask<T: Send + 'static> {
    graph: Arc<Graph<T>>,
    node: usize,
    payload: Option<T>,
    annotation: Annotation,
}

impl<T: Send + 'static> Task for ConsumeTask<T> {
    fn execute(&mut self, ctx: &TaskContext<'_>) -> TaskResult {
        if let Some(data) = self.payload.take() {
            let graph = &self.graph;
            let emitter = Emitter {
                graph,
                from: self.node,
            };
            graph.nodes[self.node].node.consume(
                ctx,
                &emitter,
                Token::with_annotation(data, self.annotation),
            );
        }
        Graph::consume_tick(&self.graph, ctx, self.node);
        TaskResult::Remove
    }
}

struct BarrierTask<T: Send + 'static> {
    graph: Arc<Graph<T>>,
    node: usize,
}

impl<T: Send + 'static> Task for BarrierTask<T> {
    fn execute(&mut self, ctx: &TaskContext<'_>) -> TaskResult {
        let graph = &self.graph;
        let slot = &graph.nodes[self.node];
        if slot.pending_barriers.fetch_sub(1, Ordering::SeqCst) == 1 {
            slot.barrier_passed.store(true, Ordering::SeqCst);
            Graph::maybe_finalize(graph, ctx, self.node);
        }
        TaskResult::Remove
    }
}

struct SequentialFinalizeTask<T: Send + 'static> {
    graph: Arc<Graph<T>>,
    node: usize,
    data: ResourcePtr,
}

impl<T: Send + 'static> Task for SequentialFinalizeTask<T> {
    fn execute(&mut self, ctx: &TaskContext<'_>) -> TaskResult {
        let graph = &self.graph;
        let emitter = Emitter {
            graph,
            from: self.node,
        };
        graph.nodes[self.node]
            .node
            .finalize(ctx, &emitter, true, self.data, ResourcePtr::null());
        Graph::complete(graph, ctx, self.node);
        TaskResult::Remove
    }
}

struct ParallelFinalizeTask<T: Send + 'static> {
    graph: Arc<Graph<T>>,
    node: usize,
    data: ResourcePtr,
}

impl<T: Send + 'static> Task for ParallelFinalizeTask<T> {
    fn execute(&mut self, ctx: &TaskContext<'_>) -> TaskResult {
        let graph = &self.graph;
        let slot = &graph.nodes[self.node];
        let is_last = slot.pending_finalizers.fetch_sub(1, Ordering::SeqCst) == 1;
        let emitter = Emitter {
            graph,
            from: self.node,
        };
        slot.node
            .finalize(ctx, &emitter, is_last, self.data, ResourcePtr::null());

        if is_last {
            Graph::parallel_wave_done(graph, ctx, self.node);
        }
        TaskResult::Remove
    }
}

struct CompletionTask<T: Send + 'static> {
    graph: Arc<Graph<T>>,
    node: usize,
}

impl<T: Send + 'static> Task for CompletionTask<T> {
    fn execute(&mut self, ctx: &TaskContext<'_>) -> TaskResult {
        let graph = &self.graph;
        let slot = &graph.nodes[self.node];
        if slot.pending_finalizers.fetch_sub(1, Ordering::SeqCst) == 1 {
            Graph::parallel_wave_done(graph, ctx, self.node);
        }
        TaskResult::Remove
    }
}

impl<T: Send + 'static> Graph<T> {
    /// After a parallel finalize (or completion) wave: consult the
    /// completion callback; either re-arm a completion wave over the
    /// finalize sequence or complete the node.
    fn parallel_wave_done(graph: &Arc<Self>, ctx: &TaskContext<'_>, node: usize) {
        let slot = &graph.nodes[node];
        let complete = slot
            .annotation
            .completion_callback()
            .is_none_or(|callback| callback.is_complete());
        if complete {
            Graph::complete(graph, ctx, node);
            return;
        }

        let sequence = slot.annotation.finalize_sequence().to_vec();
        slot.pending_finalizers
            .store(sequence.len() as isize, Ordering::SeqCst);
        for resource in sequence {
            let task = ctx.new_task(CompletionTask {
                graph: Arc::clone(graph),
                node,
            });
            task.annotate(home_annotation(resource));
            ctx.spawn(task);
        }
    }
}

enum ReduceFollowUp {
    Step(usize),
    Final,
}

struct ReduceStep {
    main: ResourcePtr,
    partner: ResourcePtr,
    follow_up: Option<ReduceFollowUp>,
    /// Predecessor steps that must run first.
    pending: AtomicIsize,
}

struct ReducePlan {
    steps: Vec<ReduceStep>,
    tasks: OnceLock<Vec<TaskRef>>,
    final_task: TaskRef,
}

struct ReduceFinalizeTask<T: Send + 'static> {
    graph: Arc<Graph<T>>,
    node: usize,
    plan: Arc<ReducePlan>,
    step: usize,
}

impl<T: Send + 'static> Task for ReduceFinalizeTask<T> {
    fn execute(&mut self, ctx: &TaskContext<'_>) -> TaskResult {
        let graph = &self.graph;
        let step = &self.plan.steps[self.step];
        let emitter = Emitter {
            graph,
            from: self.node,
        };
        graph.nodes[self.node]
            .node
            .finalize(ctx, &emitter, false, step.main, step.partner);

        match step.follow_up {
            Some(ReduceFollowUp::Step(next)) => {
                if self.plan.steps[next].pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let tasks = self.plan.tasks.get().expect("reduce plan sealed");
                    return TaskResult::SucceedAndRemove(tasks[next]);
                }
                TaskResult::Remove
            }
            Some(ReduceFollowUp::Final) => TaskResult::SucceedAndRemove(self.plan.final_task),
            None => TaskResult::Remove,
        }
    }
}
