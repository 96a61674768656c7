// SPDX-License-Identifier: Apache-2.0

//! Intrusive multiple-producer, single-consumer queue.
//!
//! Producers push lock-free from any thread; the single consumer drains the
//! queue in FIFO order. The link pointer lives inside the queued object, so
//! pushing never allocates — which is what makes the queue usable from the
//! allocator's remote-free path, where the queued object *is* the freed
//! memory.
//!
//! Internally this is a Treiber stack on the producer side; the consumer
//! detaches the whole chain with one `swap` and reverses it once, yielding
//! arrival order.

use crossbeam_utils::CachePadded;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// Objects that embed the intrusive queue link.
///
/// # Safety
/// The implementor guarantees that the returned [`AtomicPtr`] cell is
/// reserved for the queue while the object is enqueued: nothing else reads
/// or writes it between `push` and the corresponding drain.
pub unsafe trait Link: Sized {
    /// The intrusive next-pointer cell of this object.
    fn link(&self) -> &AtomicPtr<Self>;
}

/// A lock-free intrusive MPSC queue.
///
/// The queue never owns its elements; it only chains them. Dropping a
/// non-empty queue leaks nothing by itself, but the consumer is responsible
/// for draining and disposing of queued objects before their backing memory
/// goes away.
pub struct MpscQueue<T: Link> {
    head: CachePadded<AtomicPtr<T>>,
}

impl<T: Link> MpscQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// True when no element is currently enqueued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Pushes an object onto the queue. May be called from any thread.
    ///
    /// # Safety
    /// `node` must point to a live object that stays valid (and untouched by
    /// the caller) until the consumer drains it.
    pub unsafe fn push(&self, node: NonNull<T>) {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // The link is ours while the node is enqueued (Link contract).
            unsafe { node.as_ref() }.link().store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Detaches every enqueued object and yields them in FIFO order.
    ///
    /// # Safety
    /// Only the single consumer of this queue may call this, and never
    /// concurrently with itself.
    pub unsafe fn drain(&self) -> Drain<T> {
        let mut chain = self.head.swap(ptr::null_mut(), Ordering::AcqRel);

        // Reverse the LIFO chain so the iterator yields arrival order.
        let mut reversed: *mut T = ptr::null_mut();
        while let Some(node) = NonNull::new(chain) {
            let next = unsafe { node.as_ref() }.link().load(Ordering::Relaxed);
            unsafe { node.as_ref() }.link().store(reversed, Ordering::Relaxed);
            reversed = node.as_ptr();
            chain = next;
        }

        Drain { next: reversed }
    }
}

impl<T: Link> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// The queue hands out raw pointers only; cross-thread use is the point.
// Producers touch nothing but the head CAS and the node's own link cell.
unsafe impl<T: Link> Send for MpscQueue<T> {}
unsafe impl<T: Link> Sync for MpscQueue<T> {}

/// FIFO iterator over a detached chain, returned by [`MpscQueue::drain`].
pub struct Drain<T: Link> {
    next: *mut T,
}

impl<T: Link> Iterator for Drain<T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<NonNull<T>> {
        let node = NonNull::new(self.next)?;
        // Safety: nodes of a detached chain are exclusively ours.
        self.next = unsafe { node.as_ref() }.link().load(Ordering::Relaxed);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicPtr;

    struct TestNode {
        link: AtomicPtr<TestNode>,
        value: u64,
    }

    impl TestNode {
        fn boxed(value: u64) -> NonNull<TestNode> {
            let node = Box::new(TestNode {
                link: AtomicPtr::new(ptr::null_mut()),
                value,
            });
            NonNull::new(Box::into_raw(node)).unwrap()
        }
    }

    unsafe impl Link for TestNode {
        fn link(&self) -> &AtomicPtr<TestNode> {
            &self.link
        }
    }

    fn drain_values(queue: &MpscQueue<TestNode>) -> Vec<u64> {
        unsafe { queue.drain() }
            .map(|node| {
                let boxed = unsafe { Box::from_raw(node.as_ptr()) };
                boxed.value
            })
            .collect()
    }

    #[test]
    fn test_single_thread_fifo_order() {
        let queue = MpscQueue::new();
        assert!(queue.is_empty());
        for value in 0..16 {
            unsafe { queue.push(TestNode::boxed(value)) };
        }
        assert!(!queue.is_empty());
        assert_eq!(drain_values(&queue), (0..16).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_leaves_queue_reusable() {
        let queue = MpscQueue::new();
        unsafe { queue.push(TestNode::boxed(1)) };
        assert_eq!(drain_values(&queue), vec![1]);
        unsafe { queue.push(TestNode::boxed(2)) };
        assert_eq!(drain_values(&queue), vec![2]);
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 1000;

        let queue = Arc::new(MpscQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        unsafe { queue.push(TestNode::boxed(producer * PER_PRODUCER + i)) };
                    }
                })
            })
            .collect();

        let mut values = Vec::new();
        while values.len() < (PRODUCERS * PER_PRODUCER) as usize {
            values.extend(drain_values(&queue));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        values.sort_unstable();
        let expected: Vec<u64> = (0..PRODUCERS * PER_PRODUCER).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_per_producer_order_is_preserved() {
        let queue = Arc::new(MpscQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 0..500u64 {
                    unsafe { queue.push(TestNode::boxed(i)) };
                }
            })
        };
        producer.join().unwrap();

        let values = drain_values(&queue);
        let mut sorted = values.clone();
        sorted.sort_unstable();
        assert_eq!(values, sorted);
    }
}
