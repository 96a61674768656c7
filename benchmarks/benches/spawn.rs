// SPDX-License-Identifier: Apache-2.0

//! Benchmarks for task spawn and execution throughput.

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use taskmill_config::{CoreSet, RuntimeConfig};
use taskmill_runtime::{Runtime, Target, TaskResult};

const TASKS: usize = 10_000;

fn bench_local_spawn_throughput(c: &mut Criterion) {
    let mut config = RuntimeConfig::new(CoreSet::from_pairs([(0, 0), (1, 0)]));
    config.allocator_block_size = 64 << 20;
    let runtime = Runtime::start(config).expect("runtime");

    let mut group = c.benchmark_group("spawn");
    let _ = group.bench_function(BenchmarkId::new("local_chain", TASKS), |b| {
        b.iter(|| {
            let done = Arc::new(AtomicUsize::new(0));
            // One seeder task fans TASKS local tasks out on worker 0.
            let seeder = {
                let done = Arc::clone(&done);
                runtime.new_lambda_task(move |ctx| {
                    for _ in 0..TASKS {
                        let done = Arc::clone(&done);
                        let task = ctx.new_lambda_task(move |_ctx| {
                            let _ = done.fetch_add(1, Ordering::Relaxed);
                            TaskResult::Remove
                        });
                        ctx.spawn(task);
                    }
                    TaskResult::Remove
                })
            };
            seeder.annotate(Target::Worker(0));
            runtime.spawn(seeder, 0);
            while done.load(Ordering::Relaxed) < TASKS {
                std::hint::spin_loop();
            }
        });
    });
    group.finish();
    runtime.stop();
}

criterion_group!(benches, bench_local_spawn_throughput);
criterion_main!(benches);
