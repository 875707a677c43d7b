//! # graphsync Engine
//!
//! Real-time delta synchronization of a client-held graph replica.
//!
//! This crate provides:
//! - Connection pooling with heartbeat health and reconnect backoff
//! - Frame ingress: decompression, deduplication and bounded reordering
//! - Delta merge into a versioned, copy-on-write graph snapshot
//! - Last-writer-wins conflict resolution with connection priority
//! - An offline queue with controlled replay
//! - Diagnostics counters and a serializable stats snapshot
//! - A transport abstraction with an in-process loopback server
//!
//! ## Architecture
//!
//! ```text
//! transport frames -> MessageIngress -> DeltaMerger -> subscribers
//! client writes    -> DeltaMerger (optimistic) -> ConnectionPool | OfflineQueue
//! ```
//!
//! Every inbound frame from every connection is funneled through one
//! event-loop task owned by [`SyncCoordinator`], so the snapshot has a
//! single logical writer.
//!
//! ## Key Invariants
//!
//! - Applying the same op twice is a no-op
//! - Per connection, ops apply in sequence order
//! - Subscribers see versions in strictly increasing order, never a
//!   partial batch
//! - Concurrent writes resolve identically whatever their arrival order
//! - Automatic reconnects stop after the configured attempts

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod error;
mod ingress;
mod memory;
mod merger;
mod pool;
mod queue;
mod snapshot;
mod state;
mod stats;
mod transport;

pub use config::{
    HeartbeatConfig, IngressConfig, MergeConfig, PoolConfig, QueueConfig, RetryConfig,
    SyncConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_TTL,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_LATENCY_SAMPLES, DEFAULT_POOL_SIZE,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_REORDER_TIMEOUT, DEFAULT_REORDER_WINDOW,
    DEFAULT_MAX_TOMBSTONES, DEFAULT_TICK_INTERVAL, DEFAULT_TOMBSTONE_TTL,
};
pub use coordinator::{FlushReport, SnapshotUpdate, SubmitOutcome, Subscription, SyncCoordinator};
pub use error::{SyncError, SyncResult};
pub use ingress::{Ingested, MessageIngress};
pub use memory::{MemoryConnector, MemoryServer};
pub use merger::{BatchOutcome, ChangeKind, ChangeSet, DeltaMerger};
pub use pool::{ConnectionPool, ConnectionRecord, PoolEvent};
pub use queue::{OfflineQueue, QueueEntry, QueueStatus};
pub use snapshot::{GraphSnapshot, LinkRecord, NodeRecord, WriteClock};
pub use state::{
    ConnectionHealth, ConnectionState, HealthClass, StateTransition, EXCELLENT_LATENCY,
    FAIR_LATENCY, GOOD_LATENCY,
};
pub use stats::{ConnectionSummary, DetailedStats, StatsAggregator, SyncStats};
pub use transport::{Connector, FrameSink, FrameStream, TransportLink};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Milliseconds since the Unix epoch; 0 if the clock is before it.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
