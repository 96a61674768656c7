// SPDX-License-Identifier: Apache-2.0

//! A compact B-link tree over OLFIT-tagged node resources, driving the
//! optimistic read path of the runtime: readers snapshot node versions and
//! retry on mismatch, writers latch a node briefly and publish a new even
//! version, and readers chase right-sibling pointers across concurrent
//! splits.
//!
//! Structure modifications above the leaf level are serialized by a
//! tree-wide latch; leaf inserts and all lookups run fully concurrently.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use taskmill_config::{CoreSet, RuntimeConfig};
use taskmill_runtime::resource::header::ResourceHeader;
use taskmill_runtime::sync::OptimisticLock;
use taskmill_runtime::{
    IsolationLevel, Protocol, ResourceAnnotation, ResourcePtr, Runtime, Target, TaskContext,
    TaskResult,
};

const FANOUT: usize = 32;
const KEYS: u64 = 100_000;

#[derive(Clone, Copy)]
#[repr(C)]
struct TreeNode {
    is_leaf: bool,
    len: u16,
    /// Largest key this subtree may hold, inclusive. `u64::MAX` on the
    /// rightmost node of each level.
    high_key: u64,
    /// Tagged-pointer word of the right sibling; 0 at the end of a level.
    side: u64,
    keys: [u64; FANOUT],
    /// Leaf: value bits. Inner: tagged-pointer words of children, where
    /// `keys[i]` is the high key of `slots[i]`.
    slots: [u64; FANOUT],
}

impl TreeNode {
    fn empty(is_leaf: bool) -> Self {
        Self {
            is_leaf,
            len: 0,
            high_key: u64::MAX,
            side: 0,
            keys: [0; FANOUT],
            slots: [0; FANOUT],
        }
    }
}

struct Tree {
    /// Tagged-pointer word of the root node.
    root: AtomicU64,
    /// Serializes structure modifications above the leaf level.
    smo: Mutex<()>,
}

fn node_latch<'a>(node: ResourcePtr) -> &'a OptimisticLock {
    // Safety: tree nodes are built resources; their headers live for the
    // whole test (nodes are never deleted).
    unsafe {
        let user = std::ptr::NonNull::new_unchecked(node.get::<u8>());
        let header = ResourceHeader::from_user_ptr(user);
        header.as_ref().optimistic_latch()
    }
}

/// Copies the node out under version validation. Loops until a consistent
/// snapshot is taken.
fn snapshot(node: ResourcePtr) -> TreeNode {
    let latch = node_latch(node);
    loop {
        let version = latch.read_valid();
        // Safety: node memory stays mapped for the test's lifetime; the
        // validation below discards torn copies.
        let copy = unsafe { std::ptr::read_volatile(node.get::<TreeNode>()) };
        if latch.is_valid(version) {
            return copy;
        }
    }
}

fn new_node(ctx: &TaskContext<'_>, is_leaf: bool) -> ResourcePtr {
    let annotation = ResourceAnnotation::new()
        .on_worker(ctx.worker_id())
        .with_isolation(IsolationLevel::ExclusiveWriter)
        .with_protocol(Protocol::Olfit);
    let node = ctx.new_resource(annotation, TreeNode::empty(is_leaf));
    assert!(!node.is_null(), "node allocation failed");
    node
}

fn make_tree(ctx: &TaskContext<'_>) -> Arc<Tree> {
    let root = new_node(ctx, true);
    Arc::new(Tree {
        root: AtomicU64::new(root.to_word()),
        smo: Mutex::new(()),
    })
}

/// Position of the first key in `node.keys[..len]` that is `>= key`.
fn position(node: &TreeNode, key: u64) -> usize {
    node.keys[..usize::from(node.len)].partition_point(|&k| k < key)
}

fn lookup(tree: &Tree, key: u64) -> Option<i64> {
    let mut current = ResourcePtr::from_word(tree.root.load(Ordering::SeqCst));
    loop {
        let node = snapshot(current);
        if key > node.high_key && node.side != 0 {
            current = ResourcePtr::from_word(node.side);
            continue;
        }
        if node.is_leaf {
            let index = position(&node, key);
            if index < usize::from(node.len) && node.keys[index] == key {
                return Some(node.slots[index] as i64);
            }
            return None;
        }
        let index = position(&node, key).min(usize::from(node.len) - 1);
        current = ResourcePtr::from_word(node.slots[index]);
    }
}

/// Locks `start` and walks right until the locked node covers `key`.
fn lock_covering(start: ResourcePtr, key: u64) -> ResourcePtr {
    let mut current = start;
    node_latch(current).lock();
    loop {
        // Safety: we hold the latch; exclusive access to the node.
        let node = unsafe { &*current.get::<TreeNode>() };
        if key <= node.high_key || node.side == 0 {
            return current;
        }
        let next = ResourcePtr::from_word(node.side);
        node_latch(next).lock();
        node_latch(current).unlock();
        current = next;
    }
}

fn insert(ctx: &TaskContext<'_>, tree: &Tree, key: u64, value: i64) {
    // Descend optimistically, remembering the inner node of every level.
    let mut path: Vec<ResourcePtr> = Vec::with_capacity(8);
    let mut current = ResourcePtr::from_word(tree.root.load(Ordering::SeqCst));
    let leaf = loop {
        let node = snapshot(current);
        if key > node.high_key && node.side != 0 {
            current = ResourcePtr::from_word(node.side);
            continue;
        }
        if node.is_leaf {
            break current;
        }
        let index = position(&node, key).min(usize::from(node.len) - 1);
        path.push(current);
        current = ResourcePtr::from_word(node.slots[index]);
    };

    let leaf = lock_covering(leaf, key);
    // Safety: we hold the leaf latch.
    let leaf_node = unsafe { &mut *leaf.get::<TreeNode>() };

    let index = position(leaf_node, key);
    if index < usize::from(leaf_node.len) && leaf_node.keys[index] == key {
        // Idempotent overwrite keeps the test workloads simple.
        leaf_node.slots[index] = value as u64;
        node_latch(leaf).unlock();
        return;
    }

    if usize::from(leaf_node.len) < FANOUT {
        shift_in(leaf_node, index, key, value as u64);
        node_latch(leaf).unlock();
        return;
    }

    // Serialize the whole structure modification before touching the
    // shape: holders of the SMO latch never take leaf latches, so waiting
    // here with the leaf latch held cannot deadlock, and a fresh sibling
    // always gets its parent entry before anyone else may split it.
    let guard = tree.smo.lock().unwrap();

    // Split the leaf: the upper half moves to a fresh right sibling that
    // stays invisible until the latch release publishes the new shape.
    let sibling = new_node(ctx, true);
    // Safety: the sibling is unpublished; we are its only accessor.
    let sibling_node = unsafe { &mut *sibling.get::<TreeNode>() };
    let mid = FANOUT / 2;

    sibling_node.len = (FANOUT - mid) as u16;
    sibling_node.high_key = leaf_node.high_key;
    sibling_node.side = leaf_node.side;
    sibling_node.keys[..FANOUT - mid].copy_from_slice(&leaf_node.keys[mid..]);
    sibling_node.slots[..FANOUT - mid].copy_from_slice(&leaf_node.slots[mid..]);

    leaf_node.len = mid as u16;
    leaf_node.high_key = leaf_node.keys[mid - 1];
    leaf_node.side = sibling.to_word();

    let right_high = sibling_node.high_key;
    let left_high = leaf_node.high_key;

    if key <= left_high {
        shift_in(leaf_node, position(leaf_node, key), key, value as u64);
    } else {
        shift_in(sibling_node, position(sibling_node, key), key, value as u64);
    }
    node_latch(leaf).unlock();

    // Publish the split to the parent level.
    ascend(ctx, tree, path, leaf, left_high, sibling, right_high);
    drop(guard);
}

fn shift_in(node: &mut TreeNode, index: usize, key: u64, slot: u64) {
    let len = usize::from(node.len);
    assert!(len < FANOUT);
    node.keys.copy_within(index..len, index + 1);
    node.slots.copy_within(index..len, index + 1);
    node.keys[index] = key;
    node.slots[index] = slot;
    node.len = (len + 1) as u16;
}

/// Inserts the separator pair for a split child into the parent chain,
/// splitting inner nodes and growing the root as needed. Runs under the
/// tree's structure-modification latch.
fn ascend(
    ctx: &TaskContext<'_>,
    tree: &Tree,
    mut path: Vec<ResourcePtr>,
    mut left: ResourcePtr,
    mut left_high: u64,
    mut right: ResourcePtr,
    mut right_high: u64,
) {
    loop {
        let parent = match path.pop() {
            Some(parent) => parent,
            None => {
                if tree.root.load(Ordering::SeqCst) == left.to_word() {
                    // The split node was the root: grow the tree.
                    let new_root = new_node(ctx, false);
                    // Safety: unpublished node.
                    let root_node = unsafe { &mut *new_root.get::<TreeNode>() };
                    root_node.len = 2;
                    root_node.keys[0] = left_high;
                    root_node.slots[0] = left.to_word();
                    root_node.keys[1] = right_high;
                    root_node.slots[1] = right.to_word();
                    root_node.high_key = right_high;
                    tree.root.store(new_root.to_word(), Ordering::SeqCst);
                    return;
                }
                // The root grew since our descent; locate the parent
                // level again. Inner nodes are stable under the SMO latch.
                find_parent(tree, left, right_high)
            }
        };

        let parent = lock_inner_covering(parent, left);
        // Safety: we hold the parent latch.
        let parent_node = unsafe { &mut *parent.get::<TreeNode>() };
        let index = (0..usize::from(parent_node.len))
            .find(|&i| parent_node.slots[i] == left.to_word())
            .expect("split child must appear in its parent");

        parent_node.keys[index] = left_high;
        if usize::from(parent_node.len) < FANOUT {
            shift_in(parent_node, index + 1, right_high, right.to_word());
            node_latch(parent).unlock();
            return;
        }

        // Inner split, same shape as the leaf split.
        let sibling = new_node(ctx, false);
        // Safety: unpublished node.
        let sibling_node = unsafe { &mut *sibling.get::<TreeNode>() };
        let mid = FANOUT / 2;

        sibling_node.len = (FANOUT - mid) as u16;
        sibling_node.high_key = parent_node.high_key;
        sibling_node.side = parent_node.side;
        sibling_node.keys[..FANOUT - mid].copy_from_slice(&parent_node.keys[mid..]);
        sibling_node.slots[..FANOUT - mid].copy_from_slice(&parent_node.slots[mid..]);

        parent_node.len = mid as u16;
        parent_node.high_key = parent_node.keys[mid - 1];
        parent_node.side = sibling.to_word();

        let parent_new_high = parent_node.high_key;
        let parent_old_high = sibling_node.high_key;

        if right_high <= parent_new_high {
            shift_in(
                parent_node,
                position(parent_node, right_high),
                right_high,
                right.to_word(),
            );
        } else {
            shift_in(
                sibling_node,
                position(sibling_node, right_high),
                right_high,
                right.to_word(),
            );
        }
        node_latch(parent).unlock();

        left = parent;
        left_high = parent_new_high;
        right = sibling;
        right_high = parent_old_high;
    }
}

/// Finds the inner node whose child list contains `child`, descending by
/// the child's pre-split separator key. Only called under the SMO latch,
/// so inner links are stable.
fn find_parent(tree: &Tree, child: ResourcePtr, separator: u64) -> ResourcePtr {
    let mut current = ResourcePtr::from_word(tree.root.load(Ordering::SeqCst));
    loop {
        // Safety: inner nodes only change under the SMO latch we hold.
        let node = unsafe { &*current.get::<TreeNode>() };
        assert!(!node.is_leaf, "walked past the parent level");
        for i in 0..usize::from(node.len) {
            if node.slots[i] == child.to_word() {
                return current;
            }
        }
        if separator > node.high_key && node.side != 0 {
            current = ResourcePtr::from_word(node.side);
            continue;
        }
        let index = position(node, separator).min(usize::from(node.len) - 1);
        current = ResourcePtr::from_word(node.slots[index]);
    }
}

fn lock_inner_covering(start: ResourcePtr, child: ResourcePtr) -> ResourcePtr {
    let mut current = start;
    node_latch(current).lock();
    loop {
        // Safety: we hold the latch.
        let node = unsafe { &*current.get::<TreeNode>() };
        let found = (0..usize::from(node.len)).any(|i| node.slots[i] == child.to_word());
        if found || node.side == 0 {
            assert!(found, "split child must appear along its parent level");
            return current;
        }
        let next = ResourcePtr::from_word(node.side);
        node_latch(next).lock();
        node_latch(current).unlock();
        current = next;
    }
}

/// Structural check: leaves are reachable leftmost-first, keys ascend
/// strictly across the whole leaf chain, and every key respects its
/// node's high key. Returns the number of keys.
fn check(tree: &Tree) -> u64 {
    let mut current = ResourcePtr::from_word(tree.root.load(Ordering::SeqCst));
    loop {
        let node = snapshot(current);
        if node.is_leaf {
            break;
        }
        current = ResourcePtr::from_word(node.slots[0]);
    }

    let mut count = 0u64;
    let mut previous: Option<u64> = None;
    loop {
        let node = snapshot(current);
        assert!(node.is_leaf);
        for i in 0..usize::from(node.len) {
            let key = node.keys[i];
            assert!(key <= node.high_key, "key above its node's high key");
            if let Some(previous) = previous {
                assert!(previous < key, "leaf chain out of order");
            }
            previous = Some(key);
            count += 1;
        }
        if node.side == 0 {
            break;
        }
        current = ResourcePtr::from_word(node.side);
    }
    count
}

fn config(workers: u16) -> RuntimeConfig {
    let mut config = RuntimeConfig::new(CoreSet::from_pairs((0..workers).map(|cpu| (cpu, 0))));
    config.allocator_block_size = 1 << 24;
    config
}

fn wait_for(counter: &AtomicUsize, expected: usize, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while counter.load(Ordering::SeqCst) < expected {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// S1: one worker inserts the identity mapping for keys 1..=100000; every
/// key reads back and the structural check holds.
#[test]
fn test_single_worker_fill_and_verify() {
    let runtime = Runtime::start(config(1)).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    let tree_slot: Arc<Mutex<Option<Arc<Tree>>>> = Arc::new(Mutex::new(None));

    let bootstrap = {
        let done = Arc::clone(&done);
        let tree_slot = Arc::clone(&tree_slot);
        runtime.new_lambda_task(move |ctx| {
            let tree = make_tree(ctx);
            *tree_slot.lock().unwrap() = Some(Arc::clone(&tree));

            for key in 1..=KEYS {
                insert(ctx, &tree, key, key as i64);
            }

            for key in 1..=KEYS {
                assert_eq!(lookup(&tree, key), Some(key as i64), "key {key} lost");
            }
            assert_eq!(lookup(&tree, 0), None);
            assert_eq!(lookup(&tree, KEYS + 1), None);
            assert_eq!(check(&tree), KEYS);

            let _ = done.fetch_add(1, Ordering::SeqCst);
            TaskResult::Remove
        })
    };
    bootstrap.annotate(Target::Worker(0));
    runtime.spawn(bootstrap, 0);

    wait_for(&done, 1, "single-worker fill");
    runtime.stop();
}

/// S2: two workers insert disjoint ranges while two workers look keys up
/// concurrently; afterwards all keys are present.
#[test]
fn test_concurrent_inserts_and_lookups() {
    const BATCH: u64 = 2_500;

    let runtime = Runtime::start(config(4)).unwrap();
    let inserted_batches = Arc::new(AtomicUsize::new(0));
    let lookups_done = Arc::new(AtomicUsize::new(0));
    let verified = Arc::new(AtomicUsize::new(0));

    // The tree is created on worker 0, then shared with every chain.
    let tree_slot: Arc<Mutex<Option<Arc<Tree>>>> = Arc::new(Mutex::new(None));
    {
        let tree_slot = Arc::clone(&tree_slot);
        let bootstrap = runtime.new_lambda_task(move |ctx| {
            *tree_slot.lock().unwrap() = Some(make_tree(ctx));
            TaskResult::Remove
        });
        bootstrap.annotate(Target::Worker(0));
        runtime.spawn(bootstrap, 0);
    }
    let tree = {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(tree) = tree_slot.lock().unwrap().clone() {
                break tree;
            }
            assert!(Instant::now() < deadline, "tree bootstrap timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    };

    // Two inserter chains over disjoint ranges, one per worker: each task
    // inserts one batch and chains the next.
    let total_batches = (KEYS / BATCH) as usize;
    for (worker, range_start) in [(0u16, 1u64), (1u16, KEYS / 2 + 1)] {
        fn spawn_batch(
            ctx: &TaskContext<'_>,
            tree: Arc<Tree>,
            worker: u16,
            start: u64,
            end: u64,
            counter: Arc<AtomicUsize>,
        ) -> TaskResult {
            for key in start..start + BATCH {
                insert(ctx, &tree, key, key as i64);
            }
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            let next_start = start + BATCH;
            if next_start >= end {
                return TaskResult::Remove;
            }
            let next = ctx.new_lambda_task(move |ctx| {
                spawn_batch(ctx, Arc::clone(&tree), worker, next_start, end, Arc::clone(&counter))
            });
            next.annotate(Target::Worker(worker));
            TaskResult::SucceedAndRemove(next)
        }

        let tree = Arc::clone(&tree);
        let counter = Arc::clone(&inserted_batches);
        let end = range_start + KEYS / 2;
        let first = runtime.new_lambda_task(move |ctx| {
            spawn_batch(
                ctx,
                Arc::clone(&tree),
                worker,
                range_start,
                end,
                Arc::clone(&counter),
            )
        });
        first.annotate(Target::Worker(worker));
        runtime.spawn(first, 0);
    }

    // Two lookup chains run concurrently with the inserts; a hit must
    // carry the identity value.
    for worker in [2u16, 3u16] {
        let tree = Arc::clone(&tree);
        let lookups_done = Arc::clone(&lookups_done);
        let mut key = u64::from(worker);
        let looker = runtime.new_lambda_task(move |_ctx| {
            for _ in 0..20_000 {
                key = key.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                let probe = key % KEYS + 1;
                if let Some(value) = lookup(&tree, probe) {
                    assert_eq!(value, probe as i64, "lookup returned a foreign value");
                }
            }
            let _ = lookups_done.fetch_add(1, Ordering::SeqCst);
            TaskResult::Remove
        });
        looker.annotate(Target::Worker(worker));
        runtime.spawn(looker, 0);
    }

    wait_for(&inserted_batches, total_batches, "insert chains");
    wait_for(&lookups_done, 2, "lookup chains");

    // Quiescent verification on a worker.
    {
        let tree = Arc::clone(&tree);
        let verified = Arc::clone(&verified);
        let verify = runtime.new_lambda_task(move |_ctx| {
            for key in 1..=KEYS {
                assert_eq!(lookup(&tree, key), Some(key as i64), "key {key} missing");
            }
            assert_eq!(check(&tree), KEYS);
            let _ = verified.fetch_add(1, Ordering::SeqCst);
            TaskResult::Remove
        });
        verify.annotate(Target::Worker(2));
        runtime.spawn(verify, 0);
    }
    wait_for(&verified, 1, "verification");
    runtime.stop();
}
