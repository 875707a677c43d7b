//! Counters and diagnostics.

use crate::queue::QueueStatus;
use crate::state::{ConnectionHealth, ConnectionState, HealthClass, StateTransition};
use graphsync_protocol::ConnectionId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Smoothing factor of the compression ratio average.
const COMPRESSION_ALPHA: f64 = 0.2;

/// Number of state transitions kept for diagnostics.
const TRANSITION_HISTORY: usize = 32;

/// Point-in-time copy of the sync counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStats {
    /// Frames received from any connection.
    pub messages_received: u64,
    /// Frames discarded as duplicates.
    pub duplicates_detected: u64,
    /// Concurrent divergent writes resolved by last-writer-wins.
    pub conflicts_resolved: u64,
    /// Smoothed compressed/uncompressed byte ratio; 1.0 until a compressed
    /// frame has been seen.
    pub compression_ratio: f64,
    /// Frames dropped as undecodable.
    pub frames_dropped: u64,
    /// Resync requests issued.
    pub resyncs_requested: u64,
    /// Offline entries dropped on overflow.
    pub queue_overflow_drops: u64,
    /// Reconnect attempts started.
    pub reconnect_attempts: u64,
    /// Connection state transitions.
    pub state_transitions: u64,
    /// Batches that produced a new snapshot version.
    pub batches_applied: u64,
    /// Ops that changed the snapshot.
    pub ops_applied: u64,
    /// Ops discarded as already applied or superseded.
    pub ops_skipped: u64,
}

impl Default for SyncStats {
    fn default() -> Self {
        Self {
            messages_received: 0,
            duplicates_detected: 0,
            conflicts_resolved: 0,
            compression_ratio: 1.0,
            frames_dropped: 0,
            resyncs_requested: 0,
            queue_overflow_drops: 0,
            reconnect_attempts: 0,
            state_transitions: 0,
            batches_applied: 0,
            ops_applied: 0,
            ops_skipped: 0,
        }
    }
}

/// Lock-free counters shared by every component.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    messages_received: AtomicU64,
    duplicates_detected: AtomicU64,
    conflicts_resolved: AtomicU64,
    frames_dropped: AtomicU64,
    resyncs_requested: AtomicU64,
    queue_overflow_drops: AtomicU64,
    reconnect_attempts: AtomicU64,
    state_transitions: AtomicU64,
    batches_applied: AtomicU64,
    ops_applied: AtomicU64,
    ops_skipped: AtomicU64,
    compression_ratio: Mutex<Option<f64>>,
    transitions: Mutex<VecDeque<StateTransition>>,
}

impl StatsAggregator {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a received frame.
    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a duplicate.
    pub fn record_duplicate(&self) {
        self.duplicates_detected.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts resolved conflicts.
    pub fn record_conflicts(&self, count: u64) {
        self.conflicts_resolved.fetch_add(count, Ordering::Relaxed);
    }

    /// Counts a dropped frame.
    pub fn record_dropped_frame(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an issued resync request.
    pub fn record_resync(&self) {
        self.resyncs_requested.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an offline entry dropped on overflow.
    pub fn record_queue_overflow(&self) {
        self.queue_overflow_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a reconnect attempt.
    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection state change.
    pub fn record_transition(&self, transition: StateTransition) {
        self.state_transitions.fetch_add(1, Ordering::Relaxed);
        let mut history = self.transitions.lock();
        if history.len() == TRANSITION_HISTORY {
            history.pop_front();
        }
        history.push_back(transition);
    }

    /// Records the outcome of a merged batch.
    pub fn record_batch(&self, applied: u64, skipped: u64, version_bumped: bool) {
        self.ops_applied.fetch_add(applied, Ordering::Relaxed);
        self.ops_skipped.fetch_add(skipped, Ordering::Relaxed);
        if version_bumped {
            self.batches_applied.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Folds one compressed frame into the smoothed compression ratio.
    pub fn record_compression(&self, compressed_len: usize, raw_len: usize) {
        if raw_len == 0 {
            return;
        }
        let sample = compressed_len as f64 / raw_len as f64;
        let mut ratio = self.compression_ratio.lock();
        *ratio = Some(match *ratio {
            Some(current) => current + COMPRESSION_ALPHA * (sample - current),
            None => sample,
        });
    }

    /// Recent state transitions, oldest first.
    pub fn recent_transitions(&self) -> Vec<StateTransition> {
        self.transitions.lock().iter().copied().collect()
    }

    /// Copies the current counters.
    pub fn snapshot(&self) -> SyncStats {
        let compression_ratio = *self.compression_ratio.lock();
        SyncStats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            duplicates_detected: self.duplicates_detected.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            compression_ratio: compression_ratio.unwrap_or(1.0),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            resyncs_requested: self.resyncs_requested.load(Ordering::Relaxed),
            queue_overflow_drops: self.queue_overflow_drops.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            ops_applied: self.ops_applied.load(Ordering::Relaxed),
            ops_skipped: self.ops_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Per-connection line of [`DetailedStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSummary {
    /// Connection id.
    pub id: ConnectionId,
    /// Current state.
    pub state: ConnectionState,
    /// Rolling average latency in milliseconds.
    pub avg_latency_ms: Option<f64>,
    /// Consecutive failed connect attempts.
    pub consecutive_failures: u32,
    /// Heartbeats missed in a row.
    pub missed_heartbeats: u32,
}

/// Immutable diagnostics snapshot returned by
/// [`SyncCoordinator::detailed_stats`](crate::SyncCoordinator::detailed_stats).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailedStats {
    /// Best state across the pool.
    pub connection_state: ConnectionState,
    /// Whether the caller must reconnect explicitly.
    pub requires_intervention: bool,
    /// Pool-wide health.
    pub connection_health: ConnectionHealth,
    /// Health class of `connection_health`.
    pub health_class: HealthClass,
    /// Per-connection details.
    pub connections: Vec<ConnectionSummary>,
    /// Offline queue status.
    pub queue_status: QueueStatus,
    /// Counters.
    pub stats: SyncStats,
    /// Current snapshot version.
    pub snapshot_version: u64,
    /// Nodes in the snapshot.
    pub node_count: usize,
    /// Links in the snapshot.
    pub link_count: usize,
    /// Recent state transitions, oldest first.
    pub recent_transitions: Vec<StateTransition>,
}
