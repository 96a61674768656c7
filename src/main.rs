// SPDX-License-Identifier: Apache-2.0

//! `mill_engine` — demo driver for the taskmill engine.
//!
//! Starts the runtime from a JSON configuration (or detected cores), runs
//! a small partition-and-reduce dataflow job, and reports task counters.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use taskmill_config::{CoreSet, RuntimeConfig};
use taskmill_dataflow::{
    Emitter, FinalizationType, FnNode, Graph, Node, NodeAnnotation, Token, TokenGenerator,
};
use taskmill_runtime::{
    Annotation, Counter, IsolationLevel, ResourceAnnotation, ResourcePtr, Runtime, Target,
    TaskContext, TaskResult,
};

#[derive(Debug, Parser)]
#[command(name = "mill_engine", about = "taskmill demo engine")]
struct Args {
    /// Path to a JSON runtime configuration; detected cores otherwise.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of workers when no configuration file is given.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Number of values the demo job aggregates.
    #[arg(long, default_value_t = 1_000_000)]
    values: u64,

    /// Number of aggregation buckets (power of two).
    #[arg(long, default_value_t = 8)]
    buckets: usize,
}

#[derive(Default)]
struct Bucket {
    count: u64,
    sum: u64,
}

struct BucketNode {
    buckets: Vec<ResourcePtr>,
    values: u64,
    done: Arc<AtomicBool>,
}

impl Node<Item> for BucketNode {
    fn consume(&self, _ctx: &TaskContext<'_>, _emitter: &Emitter<'_, Item>, token: Token<Item>) {
        let Item::Portion { bucket, count, sum } = *token.data() else {
            return;
        };
        // Home-scheduled: the bucket's worker serializes this body.
        let state = unsafe { &mut *self.buckets[bucket].get::<Bucket>() };
        state.count += count;
        state.sum += sum;
    }

    fn finalize(
        &self,
        _ctx: &TaskContext<'_>,
        _emitter: &Emitter<'_, Item>,
        is_last: bool,
        data: ResourcePtr,
        reduced: ResourcePtr,
    ) {
        if !is_last {
            let main = unsafe { &mut *data.get::<Bucket>() };
            let partner = unsafe { &*reduced.get::<Bucket>() };
            main.count += partner.count;
            main.sum += partner.sum;
            return;
        }
        let state = unsafe { &*data.get::<Bucket>() };
        let expected = self.values * (self.values + 1) / 2;
        tracing::info!(count = state.count, sum = state.sum, expected, "job finished");
        assert_eq!(state.sum, expected, "aggregation mismatch");
        self.done.store(true, Ordering::SeqCst);
    }

    fn name(&self) -> String {
        "buckets".to_owned()
    }
}

#[derive(Debug)]
enum Item {
    Range { start: u64, len: u64 },
    Portion { bucket: usize, count: u64, sum: u64 },
}

struct RangeGenerator {
    values: u64,
    workers: u64,
}

impl TokenGenerator<Item> for RangeGenerator {
    fn generate(&self, worker_id: u16) -> Vec<Token<Item>> {
        const STRIPE: u64 = 64 * 1024;
        let mut tokens = Vec::new();
        let mut start = 1 + u64::from(worker_id) * STRIPE;
        while start <= self.values {
            let len = STRIPE.min(self.values - start + 1);
            tokens.push(Token::new(Item::Range { start, len }));
            start += self.workers * STRIPE;
        }
        tokens
    }
}

fn load_config(args: &Args) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = &args.config {
        let raw = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        return Ok(config);
    }
    let cores = CoreSet::detect(args.workers)?;
    Ok(RuntimeConfig {
        task_counter: true,
        ..RuntimeConfig::new(cores)
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let buckets = args.buckets.next_power_of_two();
    let values = args.values;

    let runtime = Runtime::start(load_config(&args)?)?;
    let done = Arc::new(AtomicBool::new(false));

    let bootstrap = {
        let done = Arc::clone(&done);
        runtime.new_lambda_task(move |ctx| {
            let bucket_resources: Vec<ResourcePtr> = (0..buckets)
                .map(|_| {
                    let annotation =
                        ResourceAnnotation::new().with_isolation(IsolationLevel::Exclusive);
                    ctx.new_resource(annotation, Bucket::default())
                })
                .collect();

            let mut graph: Graph<Item> = Graph::new(false, false);
            let scan_buckets = bucket_resources.clone();
            let scan = FnNode::new(
                "scan",
                move |ctx: &TaskContext<'_>, emitter: &Emitter<'_, Item>, token: Token<Item>| {
                let Item::Range { start, len } = *token.data() else {
                    return;
                };
                let mut counts = vec![0u64; scan_buckets.len()];
                let mut sums = vec![0u64; scan_buckets.len()];
                for value in start..start + len {
                    let bucket = value as usize & (scan_buckets.len() - 1);
                    counts[bucket] += 1;
                    sums[bucket] += value;
                }
                for (bucket, resource) in scan_buckets.iter().enumerate() {
                    if counts[bucket] == 0 {
                        continue;
                    }
                    let annotation: Annotation = Target::Resource(*resource).into();
                    emitter.emit(
                        ctx,
                        Token::with_annotation(
                            Item::Portion {
                                bucket,
                                count: counts[bucket],
                                sum: sums[bucket],
                            },
                            annotation,
                        ),
                    );
                }
            });

            let scan_id = graph.add(
                scan,
                NodeAnnotation::new().parallel().produces(RangeGenerator {
                    values,
                    workers: u64::from(ctx.workers()),
                }),
            );
            let sink_id = graph.add(
                BucketNode {
                    buckets: bucket_resources.clone(),
                    values,
                    done: Arc::clone(&done),
                },
                NodeAnnotation::new()
                    .finalization(FinalizationType::Reduce)
                    .finalizes(bucket_resources),
            );
            graph
                .make_edge(&scan_id, &sink_id)
                .expect("wiring the demo graph");

            let graph = Arc::new(graph);
            Graph::start_in(&graph, ctx);
            TaskResult::Remove
        })
    };
    bootstrap.annotate(Target::Worker(0));
    runtime.spawn(bootstrap, 0);

    while !done.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    let counters = runtime.counters();
    tracing::info!(
        dispatched = counters.total(Counter::Dispatched),
        executed = counters.total(Counter::Executed),
        stolen = counters.total(Counter::Stolen),
        "task counters"
    );
    runtime.stop();
    Ok(())
}
