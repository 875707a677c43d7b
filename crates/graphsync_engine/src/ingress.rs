//! Inbound frame pipeline: decode, decompress, deduplicate, reorder.
//!
//! [`MessageIngress`] is the boundary past which only typed, in-order,
//! deduplicated [`DeltaOp`]s travel. It is a plain synchronous state machine
//! driven by the coordinator's event loop; time comes in as an argument so
//! the reorder timeout can be tested without a runtime.

use crate::config::IngressConfig;
use crate::stats::StatsAggregator;
use graphsync_protocol::{
    content_hash, ConnectionId, DeltaOp, Frame, Heartbeat, Message, ProtocolError, ResyncRequest,
    ResyncSnapshot, FIRST_SEQUENCE,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What one inbound frame produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// Ops now eligible for merging, in sequence order (possibly empty).
    Ops(Vec<DeltaOp>),
    /// A full snapshot to install, followed by ops it released.
    Snapshot {
        /// The snapshot.
        snapshot: ResyncSnapshot,
        /// Ops past the watermark that became contiguous.
        then: Vec<DeltaOp>,
    },
    /// The stream desynced; this request must be sent.
    Resync(ResyncRequest),
    /// Heartbeat request from the server.
    Ping(Heartbeat),
    /// Heartbeat reply.
    Pong(Heartbeat),
    /// Already seen; discarded.
    Duplicate,
    /// Held in the reorder buffer.
    Buffered,
    /// Not usable; discarded.
    Dropped(ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DedupKey {
    Sequence(ConnectionId, u64),
    Content([u8; 32]),
}

/// Bounded, time-windowed set of recently seen keys.
#[derive(Debug)]
struct DedupWindow {
    ttl: Duration,
    capacity: usize,
    seen: HashSet<DedupKey>,
    order: VecDeque<(DedupKey, Instant)>,
}

impl DedupWindow {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, key: &DedupKey) -> bool {
        self.seen.contains(key)
    }

    fn insert(&mut self, key: DedupKey, now: Instant) {
        if !self.seen.insert(key) {
            return;
        }
        self.order.push_back((key, now));
        while self.order.len() > self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some((key, at)) = self.order.front().copied() {
            if now.saturating_duration_since(at) < self.ttl {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&key);
        }
    }

    /// Drops every sequence key of `connection`.
    fn forget(&mut self, connection: ConnectionId) {
        self.order
            .retain(|(key, _)| !matches!(key, DedupKey::Sequence(c, _) if *c == connection));
        self.seen
            .retain(|key| !matches!(key, DedupKey::Sequence(c, _) if *c == connection));
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Ordering state of one connection's stream.
#[derive(Debug)]
struct StreamState {
    /// Next sequence to deliver.
    next_expected: u64,
    pending: BTreeMap<u64, DeltaOp>,
    gap_since: Option<Instant>,
    resync_pending: bool,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            next_expected: FIRST_SEQUENCE,
            pending: BTreeMap::new(),
            gap_since: None,
            resync_pending: false,
        }
    }
}

impl StreamState {
    fn last_delivered(&self) -> u64 {
        self.next_expected.saturating_sub(1)
    }

    /// Pops every op contiguous with `next_expected`.
    fn drain_ready(&mut self, now: Instant) -> Vec<DeltaOp> {
        let mut ready = Vec::new();
        let mut next = self.next_expected;
        while let Some(op) = self.pending.remove(&next) {
            ready.push(op);
            next += 1;
        }
        self.next_expected = next;
        self.gap_since = if self.pending.is_empty() {
            None
        } else if ready.is_empty() {
            self.gap_since.or(Some(now))
        } else {
            Some(now)
        };
        ready
    }
}

/// Decodes, deduplicates and orders inbound frames.
pub struct MessageIngress {
    config: IngressConfig,
    stats: Arc<StatsAggregator>,
    dedup: DedupWindow,
    streams: HashMap<ConnectionId, StreamState>,
}

impl MessageIngress {
    /// Creates an ingress with no stream state.
    pub fn new(config: IngressConfig, stats: Arc<StatsAggregator>) -> Self {
        let dedup = DedupWindow::new(config.dedup_ttl, config.dedup_capacity);
        Self {
            config,
            stats,
            dedup,
            streams: HashMap::new(),
        }
    }

    /// Processes one encoded frame.
    pub fn ingest(&mut self, bytes: &[u8], now: Instant) -> Ingested {
        self.stats.record_message();

        let frame = match Frame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(err) => return self.drop_frame(err),
        };
        let (message, raw_len) = match frame.open() {
            Ok(opened) => opened,
            Err(err) => return self.drop_frame(err),
        };
        if frame.compressed {
            self.stats.record_compression(frame.payload.len(), raw_len);
        }

        match message {
            Message::Delta(op) => self.accept_op(op, now),
            Message::ResyncResponse(snapshot) => {
                let key = DedupKey::Content(content_hash(bytes));
                if self.dedup.contains(&key) {
                    self.stats.record_duplicate();
                    return Ingested::Duplicate;
                }
                self.dedup.insert(key, now);
                self.accept_snapshot(snapshot, now)
            }
            Message::Ping(hb) => Ingested::Ping(hb),
            Message::Pong(hb) => Ingested::Pong(hb),
            other => self.drop_frame(ProtocolError::UnexpectedKind {
                kind: other.kind().to_string(),
            }),
        }
    }

    /// Runs an already decoded op through dedup and ordering.
    pub fn accept_op(&mut self, op: DeltaOp, now: Instant) -> Ingested {
        let connection = op.connection_id;
        let sequence = op.sequence;
        let key = DedupKey::Sequence(connection, sequence);
        if self.dedup.contains(&key) {
            self.stats.record_duplicate();
            debug!(%connection, sequence, "duplicate op discarded");
            return Ingested::Duplicate;
        }

        let window = self.config.reorder_window;
        let buffer_limit = self.config.resync_buffer_limit;
        let stream = self.streams.entry(connection).or_default();
        let expected = stream.next_expected;

        if sequence < expected {
            self.stats.record_duplicate();
            debug!(%connection, sequence, expected, "op below delivered watermark discarded");
            return Ingested::Duplicate;
        }

        if stream.resync_pending {
            if stream.pending.len() >= buffer_limit {
                self.stats.record_dropped_frame();
                warn!(%connection, sequence, "resync buffer full, op dropped");
                return Ingested::Buffered;
            }
            stream.pending.insert(sequence, op);
            self.dedup.insert(key, now);
            return Ingested::Buffered;
        }

        if sequence == expected {
            stream.pending.insert(sequence, op);
            let ready = stream.drain_ready(now);
            self.dedup.insert(key, now);
            return Ingested::Ops(ready);
        }

        stream.pending.insert(sequence, op);
        self.dedup.insert(key, now);

        if sequence - expected > window {
            stream.resync_pending = true;
            let request = ResyncRequest {
                connection_id: connection,
                last_delivered: stream.last_delivered(),
            };
            self.stats.record_resync();
            info!(
                %connection,
                sequence,
                expected,
                window,
                "arrival beyond reorder window, requesting resync"
            );
            return Ingested::Resync(request);
        }

        stream.gap_since.get_or_insert(now);
        debug!(%connection, sequence, expected, "op buffered out of order");
        Ingested::Buffered
    }

    /// Installs a resync response into the stream state.
    pub fn accept_snapshot(&mut self, snapshot: ResyncSnapshot, now: Instant) -> Ingested {
        let connection = snapshot.connection_id;
        let stream = self.streams.entry(connection).or_default();
        let next = snapshot.watermark + 1;

        stream.resync_pending = false;
        stream.gap_since = None;
        stream.next_expected = next;
        stream.pending = stream.pending.split_off(&next);
        let then = stream.drain_ready(now);

        info!(
            %connection,
            watermark = snapshot.watermark,
            nodes = snapshot.nodes.len(),
            links = snapshot.links.len(),
            released = then.len(),
            "resync snapshot received"
        );
        Ingested::Snapshot { snapshot, then }
    }

    /// Issues resync requests for gaps open longer than the reorder timeout.
    ///
    /// Also expires old dedup entries.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<ResyncRequest> {
        self.dedup.expire(now);

        let timeout = self.config.reorder_timeout;
        let mut requests = Vec::new();
        for (connection, stream) in self.streams.iter_mut() {
            if stream.resync_pending {
                continue;
            }
            let Some(since) = stream.gap_since else {
                continue;
            };
            if now.saturating_duration_since(since) >= timeout {
                stream.resync_pending = true;
                requests.push(ResyncRequest {
                    connection_id: *connection,
                    last_delivered: stream.last_delivered(),
                });
                info!(%connection, "reorder gap timed out, requesting resync");
            }
        }
        for _ in &requests {
            self.stats.record_resync();
        }
        requests
    }

    /// Forgets a connection's stream, e.g. after its link was replaced.
    ///
    /// A new link numbers its ops from scratch, so the connection's
    /// sequence dedup keys go too.
    pub fn reset_stream(&mut self, connection: ConnectionId) {
        self.streams.remove(&connection);
        self.dedup.forget(connection);
    }

    /// Requests a resync for `connection` unless one is already pending.
    pub fn request_resync(&mut self, connection: ConnectionId) -> Option<ResyncRequest> {
        let stream = self.streams.entry(connection).or_default();
        if stream.resync_pending {
            return None;
        }
        stream.resync_pending = true;
        self.stats.record_resync();
        Some(ResyncRequest {
            connection_id: connection,
            last_delivered: stream.last_delivered(),
        })
    }

    /// Highest sequence delivered in order on `connection`.
    pub fn last_delivered(&self, connection: ConnectionId) -> u64 {
        self.streams
            .get(&connection)
            .map_or(0, StreamState::last_delivered)
    }

    /// Ops held for `connection`.
    pub fn buffered(&self, connection: ConnectionId) -> usize {
        self.streams.get(&connection).map_or(0, |s| s.pending.len())
    }

    /// Whether `connection` waits for a resync response.
    pub fn is_resync_pending(&self, connection: ConnectionId) -> bool {
        self.streams
            .get(&connection)
            .is_some_and(|s| s.resync_pending)
    }

    /// Entries currently held by the dedup window.
    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    fn drop_frame(&self, err: ProtocolError) -> Ingested {
        self.stats.record_dropped_frame();
        warn!(error = %err, "dropping undecodable frame");
        Ingested::Dropped(err)
    }
}
