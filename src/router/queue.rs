use crate::core::errors::{Result, RouterError};
use crate::router::types::{Hop, PartitionId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// A hop together with its arrival number inside the queue
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedHop {
    pub seq: u64,
    pub hop: Hop,
}

/// Ordered per-partition queue of pending hops.
///
/// Unbounded; insertion order is execution order. The lock is held only for
/// the duration of one call, never across an await.
pub struct HopQueue {
    partition: PartitionId,
    entries: Mutex<VecDeque<QueuedHop>>,
    next_seq: AtomicU64,
}

impl HopQueue {
    /// Creates an empty queue for `partition`
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            entries: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<QueuedHop>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Appends a hop to the tail and returns its arrival number
    pub fn enqueue(&self, hop: Hop) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries().push_back(QueuedHop { seq, hop });
        seq
    }

    /// Returns a copy of the head without removing it
    pub fn peek(&self) -> Result<QueuedHop> {
        self.entries()
            .front()
            .cloned()
            .ok_or_else(|| RouterError::empty_queue(self.partition))
    }

    /// Removes and returns the head regardless of which hop it is.
    ///
    /// Coordinators use [`HopQueue::complete`] instead, which cannot pop a
    /// different hop than the one that was dispatched.
    pub fn dequeue(&self) -> Result<Hop> {
        self.entries()
            .pop_front()
            .map(|entry| entry.hop)
            .ok_or_else(|| RouterError::empty_queue(self.partition))
    }

    /// Removes the entry with arrival number `seq`.
    ///
    /// This is the commit-path dequeue: normally the entry is the head, but a
    /// global abort may have reshaped the queue while the hop was in flight,
    /// so it is addressed by number instead of position. Returns false if the
    /// entry is gone.
    pub fn complete(&self, seq: u64) -> bool {
        let mut entries = self.entries();
        if entries.front().map(|e| e.seq) == Some(seq) {
            entries.pop_front();
            return true;
        }
        match entries.iter().position(|e| e.seq == seq) {
            Some(index) => entries.remove(index).is_some(),
            None => false,
        }
    }

    /// Removes every hop of `tag`, keeping the relative order of the rest.
    /// Returns how many hops were discarded.
    pub fn remove_all(&self, tag: &str) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|entry| entry.hop.transaction_tag != tag);
        before - entries.len()
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.entries().iter().any(|e| e.hop.transaction_tag == tag)
    }

    /// Whether a hop of `tag` is queued after the entry `seq`
    pub fn holds_behind(&self, tag: &str, seq: u64) -> bool {
        self.entries()
            .iter()
            .skip_while(|e| e.seq != seq)
            .skip(1)
            .any(|e| e.hop.transaction_tag == tag)
    }

    /// Tags of the queued hops, head first
    pub fn tags(&self) -> Vec<String> {
        self.entries()
            .iter()
            .map(|e| e.hop.transaction_tag.clone())
            .collect()
    }

    /// Copy of every queued entry, head first
    pub fn snapshot(&self) -> Vec<QueuedHop> {
        self.entries().iter().cloned().collect()
    }

    /// Returns the current number of queued hops
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl std::fmt::Debug for HopQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopQueue")
            .field("partition", &self.partition)
            .field("tags", &self.tags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn hop(tag: &str, is_last: bool) -> Hop {
        Hop::new(tag, is_last)
    }

    #[test]
    fn test_basic_operations() {
        let queue = HopQueue::new(0);

        assert!(queue.is_empty());
        assert!(matches!(queue.peek(), Err(RouterError::EmptyQueue { partition: 0 })));
        assert!(matches!(queue.dequeue(), Err(RouterError::EmptyQueue { .. })));

        queue.enqueue(hop("T1", false));
        queue.enqueue(hop("T1", true));
        queue.enqueue(hop("T2", true));
        assert_eq!(queue.len(), 3);

        // peek does not remove
        assert_eq!(queue.peek().unwrap().hop.transaction_tag, "T1");
        assert_eq!(queue.len(), 3);

        let first = queue.dequeue().unwrap();
        assert_eq!(first.transaction_tag, "T1");
        assert!(!first.is_last);
        assert_eq!(queue.tags(), vec!["T1", "T2"]);
    }

    #[test]
    fn test_remove_all_preserves_order_and_is_idempotent() {
        let queue = HopQueue::new(1);
        for tag in ["T1", "TX", "T2", "TX", "T3"] {
            queue.enqueue(hop(tag, false));
        }

        assert_eq!(queue.remove_all("TX"), 2);
        let once = queue.tags();
        assert_eq!(once, vec!["T1", "T2", "T3"]);

        assert_eq!(queue.remove_all("TX"), 0);
        assert_eq!(queue.tags(), once);
        assert!(!queue.contains_tag("TX"));
        assert!(queue.contains_tag("T2"));
    }

    #[test]
    fn test_holds_behind_ignores_head_and_earlier() {
        let queue = HopQueue::new(0);
        queue.enqueue(hop("A", true));
        let h = queue.enqueue(hop("H", true));
        queue.enqueue(hop("W", true));

        assert!(queue.holds_behind("W", h));
        assert!(!queue.holds_behind("A", h));
        assert!(!queue.holds_behind("H", h));
        assert!(!queue.holds_behind("W", 999));
    }

    #[test]
    fn test_complete_by_seq() {
        let queue = HopQueue::new(0);
        let a = queue.enqueue(hop("A", true));
        let b = queue.enqueue(hop("B", true));
        let c = queue.enqueue(hop("C", true));

        assert!(queue.complete(a));
        assert!(!queue.complete(a));
        // out-of-head completion after the queue was reshaped
        assert!(queue.complete(c));
        assert_eq!(queue.peek().unwrap().seq, b);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_concurrent_enqueue_keeps_per_producer_order() {
        let queue = Arc::new(HopQueue::new(0));
        let mut handles = vec![];

        for producer in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    queue.enqueue(hop(&format!("P{}-{}", producer, i), true));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), 200);
        let tags = queue.tags();
        for producer in 0..4 {
            let prefix = format!("P{}-", producer);
            let order: Vec<usize> = tags
                .iter()
                .filter(|t| t.starts_with(&prefix))
                .map(|t| t[prefix.len()..].parse().unwrap())
                .collect();
            assert_eq!(order, (0..50).collect::<Vec<_>>());
        }
    }
}
