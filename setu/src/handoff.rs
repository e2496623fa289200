//! Bounded hand-off queue between the device reader and HTTP delivery threads
//!
//! Backed by a lock-free `ArrayQueue`, so both sides return immediately: the
//! reader never stalls on a slow network and delivery never stalls on an
//! idle device. An entry is moved into a slot whole, so the consumer can never
//! observe a partially written record.

use crate::error::{Error, Result};
use crate::protocol::TelemetryEntry;
use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// What `try_enqueue` does when every slot is occupied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest entry to make room (telemetry devalues with age)
    #[default]
    DropOldest,
    /// Keep the queued entries and drop the new one
    RejectNew,
}

/// Outcome of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Stored in a free slot
    Stored,
    /// Stored after evicting the oldest entry
    DisplacedOldest,
    /// Queue full, entry dropped
    Rejected,
}

impl Enqueued {
    /// Whether the new entry is now in the queue
    pub fn is_stored(self) -> bool {
        !matches!(self, Enqueued::Rejected)
    }
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandoffStats {
    /// Entries accepted, including those that displaced an older one
    pub stored: u64,
    /// Older entries overwritten under `DropOldest`
    pub displaced: u64,
    /// New entries refused under `RejectNew`
    pub rejected: u64,
    /// Entries taken by the consumer
    pub dequeued: u64,
}

/// Single-producer/single-consumer hand-off of serialized telemetry
pub struct HandoffQueue {
    slots: ArrayQueue<TelemetryEntry>,
    policy: OverflowPolicy,
    stored: AtomicU64,
    displaced: AtomicU64,
    rejected: AtomicU64,
    dequeued: AtomicU64,
}

impl HandoffQueue {
    /// Create a queue with `capacity` slots
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("hand-off queue capacity must be positive".into()));
        }
        Ok(Self {
            slots: ArrayQueue::new(capacity),
            policy,
            stored: AtomicU64::new(0),
            displaced: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
        })
    }

    /// Publish an entry without blocking, applying the overflow policy when full
    pub fn try_enqueue(&self, entry: TelemetryEntry) -> Enqueued {
        match self.policy {
            OverflowPolicy::DropOldest => match self.slots.force_push(entry) {
                None => {
                    self.stored.fetch_add(1, Ordering::Relaxed);
                    Enqueued::Stored
                }
                Some(_evicted) => {
                    self.stored.fetch_add(1, Ordering::Relaxed);
                    self.displaced.fetch_add(1, Ordering::Relaxed);
                    Enqueued::DisplacedOldest
                }
            },
            OverflowPolicy::RejectNew => match self.slots.push(entry) {
                Ok(()) => {
                    self.stored.fetch_add(1, Ordering::Relaxed);
                    Enqueued::Stored
                }
                Err(_rejected) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    Enqueued::Rejected
                }
            },
        }
    }

    /// Take the oldest entry, or `None` when empty
    pub fn try_dequeue(&self) -> Option<TelemetryEntry> {
        let entry = self.slots.pop()?;
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn stats(&self) -> HandoffStats {
        HandoffStats {
            stored: self.stored.load(Ordering::Relaxed),
            displaced: self.displaced.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
        }
    }

    /// Release the queue, returning how many undelivered entries were discarded
    pub fn deinit(self) -> usize {
        let mut discarded = 0;
        while self.slots.pop().is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            log::info!("Discarded {} undelivered telemetry entries", discarded);
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolMode;
    use std::sync::Arc;
    use std::thread;

    fn entry(n: u32) -> TelemetryEntry {
        TelemetryEntry::new(ProtocolMode::PointCloud, format!("{{\"frame\":{}}}", n))
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(HandoffQueue::new(0, OverflowPolicy::DropOldest).is_err());
    }

    #[test]
    fn test_dequeue_empty_has_no_side_effects() {
        let queue = HandoffQueue::new(4, OverflowPolicy::DropOldest).unwrap();
        assert!(queue.try_dequeue().is_none());
        assert!(queue.try_dequeue().is_none());
        assert_eq!(queue.stats(), HandoffStats::default());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let queue = HandoffQueue::new(4, OverflowPolicy::DropOldest).unwrap();
        for n in 0..3 {
            assert_eq!(queue.try_enqueue(entry(n)), Enqueued::Stored);
        }
        assert_eq!(queue.try_dequeue().unwrap().payload(), "{\"frame\":0}");
        assert_eq!(queue.try_dequeue().unwrap().payload(), "{\"frame\":1}");
        assert_eq!(queue.try_dequeue().unwrap().payload(), "{\"frame\":2}");
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let queue = HandoffQueue::new(4, OverflowPolicy::DropOldest).unwrap();
        for n in 0..4 {
            assert_eq!(queue.try_enqueue(entry(n)), Enqueued::Stored);
        }
        assert_eq!(queue.try_enqueue(entry(4)), Enqueued::DisplacedOldest);
        assert_eq!(queue.try_enqueue(entry(5)), Enqueued::DisplacedOldest);
        assert_eq!(queue.len(), 4);

        let drained: Vec<String> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|e| e.payload().to_string())
            .collect();
        assert_eq!(
            drained,
            vec![
                "{\"frame\":2}",
                "{\"frame\":3}",
                "{\"frame\":4}",
                "{\"frame\":5}"
            ]
        );

        let stats = queue.stats();
        assert_eq!(stats.stored, 6);
        assert_eq!(stats.displaced, 2);
        assert_eq!(stats.dequeued, 4);
    }

    #[test]
    fn test_reject_new_keeps_existing_slots() {
        let queue = HandoffQueue::new(2, OverflowPolicy::RejectNew).unwrap();
        assert!(queue.try_enqueue(entry(0)).is_stored());
        assert!(queue.try_enqueue(entry(1)).is_stored());
        assert_eq!(queue.try_enqueue(entry(2)), Enqueued::Rejected);
        assert!(!Enqueued::Rejected.is_stored());

        assert_eq!(queue.try_dequeue().unwrap().payload(), "{\"frame\":0}");
        assert_eq!(queue.try_dequeue().unwrap().payload(), "{\"frame\":1}");
        assert_eq!(queue.stats().rejected, 1);
    }

    #[test]
    fn test_deinit_counts_leftovers() {
        let queue = HandoffQueue::new(4, OverflowPolicy::DropOldest).unwrap();
        queue.try_enqueue(entry(0));
        queue.try_enqueue(entry(1));
        assert_eq!(queue.deinit(), 2);
    }

    #[test]
    fn test_concurrent_producer_consumer_sees_whole_entries() {
        let queue = Arc::new(HandoffQueue::new(4, OverflowPolicy::DropOldest).unwrap());
        let producer_queue = Arc::clone(&queue);

        let producer = thread::spawn(move || {
            for n in 0..2000 {
                producer_queue.try_enqueue(entry(n));
            }
        });

        let mut last = None;
        let mut received = 0;
        while !producer.is_finished() || !queue.is_empty() {
            if let Some(e) = queue.try_dequeue() {
                let value: serde_json::Value = serde_json::from_str(e.payload()).unwrap();
                let frame = value["frame"].as_u64().unwrap();
                if let Some(prev) = last {
                    assert!(frame > prev, "entries must stay in order");
                }
                last = Some(frame);
                received += 1;
            }
        }
        producer.join().unwrap();

        let stats = queue.stats();
        assert_eq!(stats.dequeued, received);
        assert_eq!(stats.stored, 2000);
        assert_eq!(stats.stored, stats.dequeued + stats.displaced);
    }
}
