// SPDX-License-Identifier: Apache-2.0

//! End-to-end scheduling properties: worker affinity, home-worker
//! serialization of `ScheduleAll` resources, and NUMA-preferring stealing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use taskmill_config::{CoreSet, PrefetchMode, RuntimeConfig};
use taskmill_runtime::{
    Counter, IsolationLevel, PrefetchDescriptor, ResourceAnnotation, Runtime, Squad, Target,
    TaskResult,
};

fn config(pairs: &[(u16, u8)]) -> RuntimeConfig {
    let mut config = RuntimeConfig::new(CoreSet::from_pairs(pairs.iter().copied()));
    config.allocator_block_size = 1 << 22;
    config
}

fn wait_for(counter: &AtomicUsize, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while counter.load(Ordering::SeqCst) < expected {
        assert!(Instant::now() < deadline, "timed out waiting for task completion");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Property: a task annotated with worker W executes with worker id W.
#[test]
fn test_worker_affinity() {
    const TASKS_PER_WORKER: usize = 200;
    let runtime = Runtime::start(config(&[(0, 0), (1, 0), (2, 0), (3, 0)])).unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));

    for worker in 0..4u16 {
        for _ in 0..TASKS_PER_WORKER {
            let done = Arc::clone(&done);
            let violations = Arc::clone(&violations);
            let task = runtime.new_lambda_task(move |ctx| {
                if ctx.worker_id() != worker {
                    let _ = violations.fetch_add(1, Ordering::SeqCst);
                }
                let _ = done.fetch_add(1, Ordering::SeqCst);
                TaskResult::Remove
            });
            task.annotate(Target::Worker(worker));
            runtime.spawn(task, 0);
        }
    }

    wait_for(&done, 4 * TASKS_PER_WORKER);
    runtime.stop();
    assert_eq!(violations.load(Ordering::SeqCst), 0);
}

/// Property: tasks naming a `ScheduleAll` resource never run concurrently,
/// and their mutations all land.
#[test]
fn test_schedule_all_serializes_access() {
    const TASKS: usize = 2_000;
    let runtime = Runtime::start(config(&[(0, 0), (1, 0), (2, 0), (3, 0)])).unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));

    // Build the counter resource from inside the pool, then hammer it from
    // every worker.
    struct SharedCounter {
        value: u64,
        in_body: AtomicBool,
    }

    let bootstrap = {
        let done = Arc::clone(&done);
        let overlap = Arc::clone(&overlap);
        runtime.new_lambda_task(move |ctx| {
            let annotation = ResourceAnnotation::new()
                .on_worker(1)
                .with_isolation(IsolationLevel::Exclusive);
            let resource = ctx.new_resource(
                annotation,
                SharedCounter {
                    value: 0,
                    in_body: AtomicBool::new(false),
                },
            );
            assert!(!resource.is_null());

            for _ in 0..TASKS {
                let done = Arc::clone(&done);
                let overlap = Arc::clone(&overlap);
                let task = ctx.new_lambda_task(move |_ctx| {
                    // Safety by contract: the home worker serializes us.
                    let counter = unsafe { &mut *resource.get::<SharedCounter>() };
                    if counter.in_body.swap(true, Ordering::SeqCst) {
                        let _ = overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    counter.value += 1;
                    counter.in_body.store(false, Ordering::SeqCst);
                    let _ = done.fetch_add(1, Ordering::SeqCst);
                    TaskResult::Remove
                });
                task.annotate(resource);
                // Spread the spawns: half go through other workers first.
                ctx.spawn(task);
            }
            let _ = done.fetch_add(1, Ordering::SeqCst);
            TaskResult::Remove
        })
    };
    bootstrap.annotate(Target::Worker(0));
    runtime.spawn(bootstrap, 0);

    wait_for(&done, TASKS + 1);
    runtime.stop();
    assert_eq!(overlap.load(Ordering::SeqCst), 0);
}

/// Property: with a same-node victim and a cross-node victim both holding
/// stealable tasks, the same-node victim is chosen; a thief crosses the
/// NUMA boundary only after its own node ran dry.
#[test]
fn test_stealing_prefers_same_numa_node() {
    const NODE0_TASKS: usize = 2_000;
    const NODE1_TASKS: usize = 100;

    // Workers 0/1 on node 0; workers 2/3 on node 1.
    let runtime = Runtime::start(config(&[(0, 0), (1, 0), (2, 1), (3, 1)])).unwrap();

    let node0_done = Arc::new(AtomicUsize::new(0));
    let node1_done = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(AtomicBool::new(false));

    // Worker 3 spins until the test releases it, so it neither executes
    // node 1 seeds nor steals.
    {
        let release = Arc::clone(&release);
        let busy = runtime.new_lambda_task(move |_ctx| {
            while !release.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
            TaskResult::Remove
        });
        busy.annotate(Target::Worker(3));
        runtime.spawn(busy, 0);
    }

    // Seeder on worker 0: floods node 0 with stealable work, then chains
    // the node 1 seeder so node 1 seeds only appear while node 0 is still
    // loaded.
    let node0_seeder = {
        let node0_done = Arc::clone(&node0_done);
        let node1_done = Arc::clone(&node1_done);
        let violations = Arc::clone(&violations);
        let release = Arc::clone(&release);
        runtime.new_lambda_task(move |ctx| {
            for _ in 0..NODE0_TASKS {
                let node0_done = Arc::clone(&node0_done);
                let task = ctx.new_lambda_task(move |_ctx| {
                    // A few microseconds of work.
                    for _ in 0..500 {
                        std::hint::spin_loop();
                    }
                    let _ = node0_done.fetch_add(1, Ordering::SeqCst);
                    TaskResult::Remove
                });
                ctx.spawn(task);
            }

            // Seeder on worker 2: drops stealable tasks into node 1 and
            // then occupies worker 2 until the release flag.
            let node0_done = Arc::clone(&node0_done);
            let node1_done = Arc::clone(&node1_done);
            let violations = Arc::clone(&violations);
            let release = Arc::clone(&release);
            let node1_seeder = ctx.new_lambda_task(move |ctx| {
                for _ in 0..NODE1_TASKS {
                    let node0_done = Arc::clone(&node0_done);
                    let node1_done = Arc::clone(&node1_done);
                    let violations = Arc::clone(&violations);
                    let task = ctx.new_lambda_task(move |ctx| {
                        // A node-0 worker may only reach a node-1 seed
                        // after node 0 ran dry (a last task may still be
                        // in flight, hence the slack of two).
                        if ctx.numa_node_id() == 0
                            && node0_done.load(Ordering::SeqCst) + 2 < NODE0_TASKS
                        {
                            let _ = violations.fetch_add(1, Ordering::SeqCst);
                        }
                        let _ = node1_done.fetch_add(1, Ordering::SeqCst);
                        TaskResult::Remove
                    });
                    ctx.spawn(task);
                }
                // Occupy worker 2; the bound queue outranks the stealable
                // deque, so the seeds stay exposed to thieves.
                let release = Arc::clone(&release);
                let busy = ctx.new_lambda_task(move |_ctx| {
                    while !release.load(Ordering::Relaxed) {
                        std::hint::spin_loop();
                    }
                    TaskResult::Remove
                });
                busy.annotate(Target::Worker(2));
                TaskResult::SucceedAndRemove(busy)
            });
            node1_seeder.annotate(Target::Worker(2));
            TaskResult::SucceedAndRemove(node1_seeder)
        })
    };
    node0_seeder.annotate(Target::Worker(0));
    runtime.spawn(node0_seeder, 0);

    wait_for(&node0_done, NODE0_TASKS);
    release.store(true, Ordering::SeqCst);
    wait_for(&node1_done, NODE1_TASKS);
    runtime.stop();

    assert_eq!(
        violations.load(Ordering::SeqCst),
        0,
        "a node-0 worker crossed the NUMA boundary while node 0 still had stealable tasks"
    );
}

/// A squad defers tasks on its home worker and flushes them in FIFO order.
#[test]
fn test_squad_defers_and_flushes_in_order() {
    const DEFERRED: usize = 16;
    let runtime = Runtime::start(config(&[(0, 0), (1, 0)])).unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let bootstrap = {
        let done = Arc::clone(&done);
        let order = Arc::clone(&order);
        runtime.new_lambda_task(move |ctx| {
            let squad = ctx.new_squad(1);
            assert!(!squad.is_null());

            // Defer on the squad's home worker, then flush there too.
            let done = Arc::clone(&done);
            let order = Arc::clone(&order);
            let filler = ctx.new_lambda_task(move |ctx| {
                let state = unsafe { &*squad.get::<Squad>() };
                for sequence in 0..DEFERRED {
                    let done = Arc::clone(&done);
                    let order = Arc::clone(&order);
                    let task = ctx.new_lambda_task(move |ctx| {
                        assert_eq!(ctx.worker_id(), 1, "squad task left its home worker");
                        order.lock().unwrap().push(sequence);
                        let _ = done.fetch_add(1, Ordering::SeqCst);
                        TaskResult::Remove
                    });
                    task.annotate(squad);
                    state.defer(task);
                }
                assert_eq!(state.len(), DEFERRED);
                state.flush(ctx);
                TaskResult::Remove
            });
            filler.annotate(squad);
            ctx.spawn(filler);
            TaskResult::Remove
        })
    };
    bootstrap.annotate(Target::Worker(0));
    runtime.spawn(bootstrap, 0);

    wait_for(&done, DEFERRED);
    runtime.stop();

    let order = order.lock().unwrap();
    let expected: Vec<usize> = (0..DEFERRED).collect();
    assert_eq!(*order, expected, "squad flush broke FIFO order");
}

/// With a fixed prefetch distance, queued tasks that declare a prefetch
/// descriptor get their resources prefetched ahead of execution.
#[test]
fn test_fixed_prefetch_issues_descriptors() {
    const TASKS: usize = 256;
    let mut config = config(&[(0, 0), (1, 0)]);
    config.prefetch = PrefetchMode::Fixed(4);
    config.task_counter = true;
    let runtime = Runtime::start(config).unwrap();

    let done = Arc::new(AtomicUsize::new(0));

    let seeded = Arc::new(AtomicBool::new(false));
    let bootstrap = {
        let done = Arc::clone(&done);
        let seeded = Arc::clone(&seeded);
        runtime.new_lambda_task(move |ctx| {
            let annotation = ResourceAnnotation::new()
                .on_worker(1)
                .with_isolation(IsolationLevel::Exclusive);
            let resource = ctx.new_resource(annotation, [0u8; 256]);
            assert!(!resource.is_null());

            // Hold worker 1 until the whole burst is queued, so its bound
            // queue is deep enough for the lookahead to engage.
            {
                let seeded = Arc::clone(&seeded);
                let gate = ctx.new_lambda_task(move |_ctx| {
                    while !seeded.load(Ordering::Acquire) {
                        std::hint::spin_loop();
                    }
                    TaskResult::Remove
                });
                gate.annotate(Target::Worker(1));
                ctx.spawn(gate);
            }

            for _ in 0..TASKS {
                let done = Arc::clone(&done);
                let task = ctx.new_lambda_task(move |_ctx| {
                    let _ = done.fetch_add(1, Ordering::SeqCst);
                    TaskResult::Remove
                });
                task.annotate(resource);
                task.set_prefetch(PrefetchDescriptor::new(resource, 256));
                ctx.spawn(task);
            }
            seeded.store(true, Ordering::Release);
            let _ = done.fetch_add(1, Ordering::SeqCst);
            TaskResult::Remove
        })
    };
    bootstrap.annotate(Target::Worker(0));
    runtime.spawn(bootstrap, 0);

    wait_for(&done, TASKS + 1);
    let counters = runtime.counters();
    runtime.stop();
    assert!(
        counters.get(1, Counter::Prefetched) > 0,
        "no prefetches were issued for a loaded bound queue"
    );
}
