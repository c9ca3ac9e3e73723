use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};
use tracing::warn;

pub const DEFAULT_CAPACITY: usize = 1 << 16;

/// Counters shared by both ends of a dispatch ring.
#[derive(Debug, Default)]
pub struct RingStats {
    submitted: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
}

impl RingStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Messages refused because the consumer was a full ring behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.submitted.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.dispatched.store(0, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }
}

/// Scheduler side of the ring. Never blocks.
pub struct RingProducer {
    inner: HeapProd<u32>,
    stats: Arc<RingStats>,
}

/// Dispatch-thread side of the ring.
pub struct RingConsumer {
    inner: HeapCons<u32>,
    stats: Arc<RingStats>,
}

/// Splits a new ring with room for `capacity` messages, rounded up to a
/// power of two.
pub fn dispatch_ring(capacity: usize, stats: Arc<RingStats>) -> (RingProducer, RingConsumer) {
    let capacity = capacity.max(2).next_power_of_two();
    let (producer, consumer) = HeapRb::<u32>::new(capacity).split();
    (
        RingProducer {
            inner: producer,
            stats: stats.clone(),
        },
        RingConsumer {
            inner: consumer,
            stats,
        },
    )
}

impl RingProducer {
    /// Queues one packed message. When the ring is full the new message is
    /// dropped and counted; unread messages are never overwritten.
    pub fn submit(&mut self, packed: u32) -> bool {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        if self.inner.try_push(packed).is_ok() {
            return true;
        }

        let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped.is_power_of_two() {
            warn!(dropped, "dispatch ring full, dropping messages");
        }
        false
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }

    pub fn len(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn stats(&self) -> &Arc<RingStats> {
        &self.stats
    }
}

impl RingConsumer {
    pub fn pop(&mut self) -> Option<u32> {
        self.inner.try_pop()
    }

    pub fn len(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn stats(&self) -> &Arc<RingStats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> (RingProducer, RingConsumer) {
        dispatch_ring(capacity, Arc::new(RingStats::default()))
    }

    fn drain(consumer: &mut RingConsumer) -> Vec<u32> {
        std::iter::from_fn(|| consumer.pop()).collect()
    }

    #[test]
    fn rounds_capacity_to_power_of_two() {
        assert_eq!(ring(1000).0.capacity(), 1024);
        assert_eq!(ring(0).0.capacity(), 2);
        assert_eq!(ring(DEFAULT_CAPACITY).0.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn drains_in_submit_order() {
        let capacity = 64;
        let (mut producer, mut consumer) = ring(capacity);
        let sent: Vec<u32> = (0..capacity as u32 - 1).map(|i| i * 7 + 1).collect();
        for &msg in &sent {
            assert!(producer.submit(msg));
        }
        assert_eq!(drain(&mut consumer), sent);
        assert!(consumer.is_empty());
    }

    #[test]
    fn keeps_order_across_wraparound() {
        let (mut producer, mut consumer) = ring(8);
        let mut received = Vec::new();
        for round in 0..5u32 {
            for i in 0..6 {
                producer.submit(round * 100 + i);
            }
            received.extend(drain(&mut consumer));
        }
        let expected: Vec<u32> = (0..5u32)
            .flat_map(|round| (0..6).map(move |i| round * 100 + i))
            .collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn full_ring_drops_newest_and_counts() {
        let (mut producer, mut consumer) = ring(4);
        for msg in 0..7 {
            producer.submit(msg);
        }
        let stats = producer.stats().clone();
        assert_eq!(stats.submitted(), 7);
        assert_eq!(stats.dropped(), 3);
        assert_eq!(drain(&mut consumer), vec![0, 1, 2, 3]);
    }
}
