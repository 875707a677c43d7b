//! Offline queue of client-originated writes.

use graphsync_protocol::DeltaOp;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::warn;

/// A client write waiting to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// Queue-local id, increasing in enqueue order.
    pub id: u64,
    /// The write.
    pub op: DeltaOp,
    /// When the write was queued.
    pub enqueued_at: Instant,
    /// Failed send attempts so far.
    pub retry_count: u32,
}

/// Queue status surfaced in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Entries waiting.
    pub queue_size: usize,
    /// Whether a flush is running.
    pub is_syncing: bool,
    /// Entries dropped on overflow since creation.
    pub dropped: u64,
    /// Queue bound.
    pub capacity: usize,
}

/// Bounded FIFO of writes made while no connection was healthy.
///
/// When full, the oldest entry is dropped: availability over completeness.
/// Entries leave the queue only when acknowledged or cleared.
#[derive(Debug)]
pub struct OfflineQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
    next_id: u64,
    dropped: u64,
    syncing: bool,
}

impl OfflineQueue {
    /// Creates an empty queue holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            next_id: 1,
            dropped: 0,
            syncing: false,
        }
    }

    /// Appends a write, returning the entry dropped to make room, if any.
    pub fn enqueue(&mut self, op: DeltaOp, now: Instant) -> Option<QueueEntry> {
        let dropped = if self.entries.len() >= self.capacity {
            self.dropped += 1;
            let oldest = self.entries.pop_front();
            warn!(
                capacity = self.capacity,
                dropped_total = self.dropped,
                "offline queue full, dropping oldest entry"
            );
            oldest
        } else {
            None
        };

        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(QueueEntry {
            id,
            op,
            enqueued_at: now,
            retry_count: 0,
        });
        dropped
    }

    /// Oldest entry.
    pub fn front(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    /// Removes an entry whose send was acknowledged.
    pub fn acknowledge(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|e| e.id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Bumps the retry count of an entry whose send failed.
    pub fn record_failure(&mut self, id: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.retry_count += 1;
        }
    }

    /// Discards every entry without sending. Returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Marks a flush as started. Returns false if one is already running.
    pub fn begin_sync(&mut self) -> bool {
        if self.syncing {
            return false;
        }
        self.syncing = true;
        true
    }

    /// Marks the running flush as finished.
    pub fn end_sync(&mut self) {
        self.syncing = false;
    }

    /// Whether a flush is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped on overflow.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Iterates entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Current status.
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queue_size: self.entries.len(),
            is_syncing: self.syncing,
            dropped: self.dropped,
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphsync_protocol::{Attributes, ConnectionId, DeltaBody};

    fn op(seq: u64) -> DeltaOp {
        DeltaOp::new(
            ConnectionId::LOCAL,
            seq,
            seq * 10,
            DeltaBody::update_node(format!("n{seq}"), Attributes::new()),
        )
    }

    #[test]
    fn fifo_order() {
        let mut queue = OfflineQueue::new(10);
        let now = Instant::now();
        for seq in 1..=3 {
            assert!(queue.enqueue(op(seq), now).is_none());
        }
        let seqs: Vec<_> = queue.iter().map(|e| e.op.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(queue.front().unwrap().op.sequence, 1);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut queue = OfflineQueue::new(3);
        let now = Instant::now();
        for seq in 1..=3 {
            queue.enqueue(op(seq), now);
        }
        let dropped = queue.enqueue(op(4), now).unwrap();

        assert_eq!(dropped.op.sequence, 1);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.front().unwrap().op.sequence, 2);
    }

    #[test]
    fn acknowledge_and_failure() {
        let mut queue = OfflineQueue::new(10);
        let now = Instant::now();
        queue.enqueue(op(1), now);
        queue.enqueue(op(2), now);

        let first = queue.front().unwrap().id;
        queue.record_failure(first);
        queue.record_failure(first);
        assert_eq!(queue.front().unwrap().retry_count, 2);

        assert!(queue.acknowledge(first));
        assert!(!queue.acknowledge(first));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front().unwrap().op.sequence, 2);
    }

    #[test]
    fn sync_flag_is_exclusive() {
        let mut queue = OfflineQueue::new(10);
        assert!(queue.begin_sync());
        assert!(!queue.begin_sync());
        assert!(queue.status().is_syncing);
        queue.end_sync();
        assert!(queue.begin_sync());
    }

    #[test]
    fn clear_discards_everything() {
        let mut queue = OfflineQueue::new(10);
        let now = Instant::now();
        queue.enqueue(op(1), now);
        queue.enqueue(op(2), now);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.status().queue_size, 0);
    }
}
