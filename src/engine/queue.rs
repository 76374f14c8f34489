//! Bounded FIFO queue between two arrows.
//!
//! Backed by a `crossbeam_channel::bounded` channel whose sender and
//! receiver are both held by the queue, so the channel never disconnects.
//! A full queue never drops an item: `push` either waits (bounded by the
//! push timeout) or hands the item straight back to the caller.
//!
//! Besides occupancy, the queue tracks how many producer arrows are still
//! live. A queue with no live producers and no items is *drained*; that is
//! how end-of-stream travels downstream.

use crate::config::PushPolicy;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Bounded multi-producer multi-consumer queue.
pub struct Queue<T> {
    name: String,
    capacity: usize,
    policy: PushPolicy,
    push_timeout: Duration,
    tx: Sender<T>,
    rx: Receiver<T>,
    registered_producers: AtomicUsize,
    live_producers: AtomicUsize,
    pushed: AtomicU64,
    popped: AtomicU64,
}

impl<T> Queue<T> {
    /// Create a fail-fast queue. `capacity` must be at least 1.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self::with_policy(name, capacity, PushPolicy::FailFast, Duration::ZERO)
    }

    pub fn with_policy(
        name: impl Into<String>,
        capacity: usize,
        policy: PushPolicy,
        push_timeout: Duration,
    ) -> Self {
        debug_assert!(capacity > 0, "zero-capacity queues are rendezvous channels");
        let (tx, rx) = bounded(capacity);
        Self {
            name: name.into(),
            capacity,
            policy,
            push_timeout,
            tx,
            rx,
            registered_producers: AtomicUsize::new(0),
            live_producers: AtomicUsize::new(0),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an item. On a full queue the item is returned in `Err`.
    pub fn push(&self, item: T) -> Result<(), T> {
        let result = match self.policy {
            PushPolicy::FailFast => self.tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(item) | TrySendError::Disconnected(item) => item,
            }),
            PushPolicy::Blocking => self
                .tx
                .send_timeout(item, self.push_timeout)
                .map_err(|e| match e {
                    SendTimeoutError::Timeout(item) | SendTimeoutError::Disconnected(item) => item,
                }),
        };
        if result.is_ok() {
            self.pushed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Remove the oldest item, if any. Never blocks.
    pub fn pop(&self) -> Option<T> {
        let item = self.rx.try_recv().ok();
        if item.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Remove up to `max` items in FIFO order.
    pub fn pop_batch(&self, max: usize) -> Vec<T> {
        let items: Vec<T> = self.rx.try_iter().take(max).collect();
        self.popped.fetch_add(items.len() as u64, Ordering::Relaxed);
        items
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free (a snapshot; other producers may race)
    pub fn free_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Total items accepted since creation
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Total items removed since creation
    pub fn popped(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }

    pub(crate) fn register_producer(&self) {
        self.registered_producers.fetch_add(1, Ordering::SeqCst);
        self.live_producers.fetch_add(1, Ordering::SeqCst);
    }

    /// One producer will push no more items (until resumed).
    pub(crate) fn producer_finished(&self) {
        let prev = self.live_producers.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "queue '{}' producer count underflow", self.name);
    }

    pub(crate) fn producer_resumed(&self) {
        let prev = self.live_producers.fetch_add(1, Ordering::SeqCst);
        debug_assert!(
            prev < self.registered_producers.load(Ordering::SeqCst),
            "queue '{}' resumed more producers than registered",
            self.name
        );
    }

    pub fn live_producers(&self) -> usize {
        self.live_producers.load(Ordering::SeqCst)
    }

    /// No live producer remains and every item has been consumed.
    pub fn is_drained(&self) -> bool {
        // Producer count first: a producer's last push happens-before its close.
        self.live_producers.load(Ordering::SeqCst) == 0 && self.rx.is_empty()
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("live_producers", &self.live_producers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = Queue::new("q", 4);
        for i in 0..3 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop_batch(10), vec![1, 2]);
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.pushed(), 3);
        assert_eq!(queue.popped(), 3);
    }

    #[test]
    fn test_fail_fast_hands_item_back() {
        let queue = Queue::new("q", 2);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert!(queue.is_full());
        assert_eq!(queue.push(3), Err(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.free_capacity(), 0);
    }

    #[test]
    fn test_blocking_push_waits_for_space() {
        let queue = Arc::new(Queue::with_policy(
            "q",
            1,
            PushPolicy::Blocking,
            Duration::from_secs(5),
        ));
        queue.push(1).unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.pop()
            })
        };
        queue.push(2).expect("blocking push succeeds once space frees up");
        assert_eq!(consumer.join().unwrap(), Some(1));
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn test_blocking_push_times_out() {
        let queue = Queue::with_policy("q", 1, PushPolicy::Blocking, Duration::from_millis(5));
        queue.push(1).unwrap();
        assert_eq!(queue.push(2), Err(2));
    }

    #[test]
    fn test_drained_requires_no_producers_and_no_items() {
        let queue = Queue::new("q", 4);
        assert!(queue.is_drained(), "unwired queue is trivially drained");

        queue.register_producer();
        assert!(!queue.is_drained());
        queue.push(5).unwrap();
        queue.producer_finished();
        assert!(!queue.is_drained(), "items remain");
        queue.pop();
        assert!(queue.is_drained());

        queue.producer_resumed();
        assert!(!queue.is_drained());
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_size_never_exceeds_capacity(
            capacity in 1usize..16,
            ops in prop::collection::vec(any::<bool>(), 1..200)
        ) {
            let queue = Queue::new("prop", capacity);
            let mut model = std::collections::VecDeque::new();
            let mut next = 0u32;
            for push in ops {
                if push {
                    let accepted = queue.push(next).is_ok();
                    prop_assert_eq!(accepted, model.len() < capacity);
                    if accepted {
                        model.push_back(next);
                    }
                    next += 1;
                } else {
                    prop_assert_eq!(queue.pop(), model.pop_front());
                }
                prop_assert!(queue.len() <= capacity);
                prop_assert_eq!(queue.len(), model.len());
            }
        }
    }
}
