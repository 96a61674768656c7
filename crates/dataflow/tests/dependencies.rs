// SPDX-License-Identifier: Apache-2.0

//! Pipeline dependency ordering: a pipeline starts only after every
//! pipeline it depends on has finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use taskmill_config::{CoreSet, RuntimeConfig};
use taskmill_dataflow::{Emitter, FnNode, Graph, NodeAnnotation, Token, TokenGenerator};
use taskmill_runtime::TaskContext;
use taskmill_runtime::Runtime;

struct Numbers {
    count: u64,
}

impl TokenGenerator<u64> for Numbers {
    fn generate(&self, _worker_id: u16) -> Vec<Token<u64>> {
        (0..self.count).map(Token::new).collect()
    }
}

fn config(workers: u16) -> RuntimeConfig {
    let mut config = RuntimeConfig::new(CoreSet::from_pairs((0..workers).map(|cpu| (cpu, 0))));
    config.allocator_block_size = 1 << 22;
    config.graph_times = true;
    config
}

/// Three chained pipelines: start and finish timestamps must interleave as
/// `finish(P1) < start(P2)` and `finish(P2) < start(P3)`.
#[test]
fn test_dependent_pipelines_start_in_order() {
    let runtime = Runtime::start(config(2)).unwrap();

    let mut graph: Graph<u64> = Graph::new(true, true);
    let sums: Arc<[AtomicU64; 3]> =
        Arc::new([AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)]);

    let mut node_ids = Vec::new();
    for stage in 0..3usize {
        let sums = Arc::clone(&sums);
        let node = FnNode::new(
            format!("stage-{stage}"),
            move |_ctx: &TaskContext<'_>, _emitter: &Emitter<'_, u64>, token: Token<u64>| {
                let _ = sums[stage].fetch_add(*token.data() + 1, Ordering::SeqCst);
            },
        );
        let id = graph.add(
            node,
            NodeAnnotation::new().produces(Numbers { count: 100 }),
        );
        node_ids.push(id);
    }

    graph.make_dependency(&node_ids[1], &node_ids[0]).unwrap();
    graph.make_dependency(&node_ids[2], &node_ids[1]).unwrap();

    let graph = Arc::new(graph);
    Graph::start(&graph, &runtime, 0);

    let deadline = Instant::now() + Duration::from_secs(30);
    while !graph.is_completed() {
        assert!(Instant::now() < deadline, "graph did not complete");
        std::thread::sleep(Duration::from_millis(1));
    }
    graph.wait();

    // All three stages consumed their hundred tokens.
    for stage in 0..3 {
        assert_eq!(sums[stage].load(Ordering::SeqCst), 100 * 101 / 2);
        assert_eq!(graph.count_emitted(&node_ids[stage]), 0);
    }

    let pipelines: Vec<_> = node_ids
        .iter()
        .map(|node| graph.pipeline_of(node))
        .collect();
    let starts: Vec<Instant> = pipelines
        .iter()
        .map(|&pipeline| graph.start_time(pipeline).expect("missing start time"))
        .collect();
    let finishes: Vec<Instant> = node_ids
        .iter()
        .map(|node| graph.finish_time(node).expect("missing finish time"))
        .collect();

    assert!(starts[0] < starts[1] && starts[1] < starts[2]);
    assert!(finishes[0] <= starts[1], "P2 started before P1 finished");
    assert!(finishes[1] <= starts[2], "P3 started before P2 finished");
    runtime.stop();
}
