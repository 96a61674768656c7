// SPDX-License-Identifier: Apache-2.0

//! Benchmarks for the worker-local allocator.

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use taskmill_alloc::Allocator;
use taskmill_config::CoreSet;

fn bench_local_round_trip(c: &mut Criterion) {
    let allocator = Allocator::new(&CoreSet::from_pairs([(0, 0)]), 64 << 20);
    unsafe { allocator.initialize_worker_heap(0) };

    let mut group = c.benchmark_group("allocator");
    for size in [64usize, 1024, 16 * 1024] {
        let _ = group.bench_function(BenchmarkId::new("alloc_free", size), |b| {
            b.iter(|| unsafe {
                let user = allocator.allocate(0, 0, 64, size).expect("allocation");
                allocator.free(0, user);
            });
        });
    }
    group.finish();
}

fn bench_remote_free_drain(c: &mut Criterion) {
    let allocator = Allocator::new(&CoreSet::from_pairs([(0, 0), (1, 0)]), 64 << 20);
    unsafe { allocator.initialize_worker_heap(0) };

    let mut group = c.benchmark_group("allocator");
    let _ = group.bench_function("remote_free_batch_1024", |b| {
        b.iter(|| unsafe {
            let chunks: Vec<_> = (0..1024)
                .map(|_| allocator.allocate(0, 0, 64, 256).expect("allocation"))
                .collect();
            // Worker 1 frees everything remotely; worker 0 folds it back.
            for user in chunks {
                allocator.free(1, user);
            }
            allocator.refund_remote_freed(0);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_local_round_trip, bench_remote_free_drain);
criterion_main!(benches);
