//! Connection pool: link lifecycle, heartbeats and reconnect backoff.
//!
//! Every pooled connection has one reader task that forwards raw frames
//! into the coordinator's event channel, so a stalled connection never
//! blocks another. All record mutation happens under one short
//! `parking_lot` lock that is never held across an await.

use crate::config::{HeartbeatConfig, PoolConfig, RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::state::{ConnectionHealth, ConnectionState, StateTransition};
use crate::stats::StatsAggregator;
use crate::transport::{Connector, FrameSink, FrameStream, TransportLink};
use crate::unix_millis;
use graphsync_protocol::{ConnectionId, Frame, Heartbeat, Message};
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Something the coordinator needs to hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A link came up.
    Connected {
        /// Connection that came up.
        connection: ConnectionId,
        /// False for the first successful connect.
        reconnect: bool,
    },
    /// Raw frame read from a link.
    Frame {
        /// Connection it arrived on.
        connection: ConnectionId,
        /// Encoded frame.
        bytes: Vec<u8>,
    },
    /// A link went down.
    Closed {
        /// Connection that went down.
        connection: ConnectionId,
        /// Why, if known.
        reason: Option<String>,
    },
    /// A connection changed state.
    Transition(StateTransition),
}

/// Health bookkeeping of one pooled connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    /// Connection id.
    pub id: ConnectionId,
    /// Current state.
    pub state: ConnectionState,
    /// Most recent round-trip samples, oldest first.
    pub latency_samples: VecDeque<Duration>,
    /// When the last pong (or the connect) was seen.
    pub last_heartbeat: Option<Instant>,
    /// Failed connect attempts in a row.
    pub consecutive_failures: u32,
    /// Unanswered pings in a row.
    pub missed_heartbeats: u32,
}

impl ConnectionRecord {
    fn new(id: ConnectionId, state: ConnectionState) -> Self {
        Self {
            id,
            state,
            latency_samples: VecDeque::new(),
            last_heartbeat: None,
            consecutive_failures: 0,
            missed_heartbeats: 0,
        }
    }

    /// Mean of the latency samples.
    pub fn avg_latency(&self) -> Option<Duration> {
        if self.latency_samples.is_empty() {
            return None;
        }
        let total: Duration = self.latency_samples.iter().sum();
        Some(total / self.latency_samples.len() as u32)
    }
}

struct Slot {
    record: ConnectionRecord,
    sink: Option<Arc<dyn FrameSink>>,
    outstanding_ping: Option<(u64, Instant)>,
    /// Bumped on every new link so stale reader tasks can tell.
    generation: u64,
}

/// Maintains the pooled links to the server.
pub struct ConnectionPool<C: Connector> {
    connector: Arc<C>,
    config: PoolConfig,
    heartbeat: HeartbeatConfig,
    retry: RetryConfig,
    slots: RwLock<BTreeMap<ConnectionId, Slot>>,
    stats: Arc<StatsAggregator>,
    events: mpsc::UnboundedSender<PoolEvent>,
    cancel: CancellationToken,
    nonce: AtomicU64,
}

impl<C: Connector> ConnectionPool<C> {
    /// Creates a pool. Nothing connects until [`connect`](Self::connect).
    pub fn new(
        connector: C,
        config: &SyncConfig,
        stats: Arc<StatsAggregator>,
        events: mpsc::UnboundedSender<PoolEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector: Arc::new(connector),
            config: config.pool.clone(),
            heartbeat: config.heartbeat.clone(),
            retry: config.retry.clone(),
            slots: RwLock::new(BTreeMap::new()),
            stats,
            events,
            cancel,
            nonce: AtomicU64::new(0),
        })
    }

    /// Opens every configured connection that is not already up.
    ///
    /// Succeeds if at least one connection came up. Failed attempts fall
    /// back to the reconnect schedule.
    pub async fn connect(self: &Arc<Self>) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Shutdown);
        }

        let mut attempts = JoinSet::new();
        {
            let mut slots = self.slots.write();
            for id in self.config.connection_ids() {
                match slots.get_mut(&id) {
                    Some(slot) if !slot.record.state.can_reconnect() => continue,
                    Some(slot) => {
                        slot.record.consecutive_failures = 0;
                        self.set_state(slot, ConnectionState::Connecting);
                    }
                    None => {
                        self.insert_slot(&mut slots, id, ConnectionState::Connecting);
                    }
                }
                let pool = Arc::clone(self);
                attempts.spawn(async move { (id, pool.attempt(id, false).await) });
            }
        }

        if attempts.is_empty() {
            return Ok(());
        }

        let mut connected = 0usize;
        let mut last_error = None;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((_, Ok(()))) => connected += 1,
                Ok((id, Err(err))) => last_error = Some((id, err)),
                Err(join_err) => warn!(error = %join_err, "connect task failed"),
            }
        }

        match (connected, last_error) {
            (0, Some((_, SyncError::Shutdown))) => Err(SyncError::Shutdown),
            (0, Some((connection, err))) => Err(SyncError::ConnectionFailed {
                connection,
                reason: err.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Explicitly reconnects one connection, e.g. out of `failed`.
    pub async fn reconnect(self: &Arc<Self>, id: ConnectionId) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Shutdown);
        }
        {
            let mut slots = self.slots.write();
            match slots.get_mut(&id) {
                Some(slot) if slot.record.state.can_reconnect() => {
                    slot.record.consecutive_failures = 0;
                    self.set_state(slot, ConnectionState::Reconnecting);
                }
                Some(slot) => {
                    return Err(SyncError::InvalidStateTransition {
                        from: slot.record.state.to_string(),
                        to: ConnectionState::Reconnecting.to_string(),
                    });
                }
                None => {
                    self.insert_slot(&mut slots, id, ConnectionState::Reconnecting);
                }
            }
        }
        self.attempt(id, true).await
    }

    /// Reconnects every connection in `failed` or `disconnected`.
    ///
    /// Returns how many came back up.
    pub async fn reconnect_failed(self: &Arc<Self>) -> usize {
        let ids: Vec<ConnectionId> = self
            .slots
            .read()
            .values()
            .filter(|slot| slot.record.state.can_reconnect())
            .map(|slot| slot.record.id)
            .collect();

        let mut recovered = 0;
        for id in ids {
            match self.reconnect(id).await {
                Ok(()) => recovered += 1,
                Err(err) => warn!(connection = %id, error = %err, "explicit reconnect failed"),
            }
        }
        recovered
    }

    /// Sends a frame on the healthy connection with the lowest latency.
    pub async fn send(&self, frame: Vec<u8>) -> SyncResult<ConnectionId> {
        let (id, sink) = {
            let slots = self.slots.read();
            slots
                .values()
                .filter(|slot| slot.record.state.is_healthy())
                .filter_map(|slot| slot.sink.as_ref().map(|sink| (slot, sink)))
                .min_by_key(|(slot, _)| {
                    (
                        slot.record.state != ConnectionState::Connected,
                        slot.record.avg_latency().unwrap_or(Duration::ZERO),
                        slot.record.id,
                    )
                })
                .map(|(slot, sink)| (slot.record.id, Arc::clone(sink)))
                .ok_or(SyncError::NotConnected)?
        };
        sink.send(frame).await?;
        Ok(id)
    }

    /// Sends a frame on one specific connection.
    pub async fn send_to(&self, id: ConnectionId, frame: Vec<u8>) -> SyncResult<()> {
        let sink = {
            let slots = self.slots.read();
            slots
                .get(&id)
                .filter(|slot| slot.record.state.is_healthy())
                .and_then(|slot| slot.sink.clone())
                .ok_or(SyncError::NotConnected)?
        };
        sink.send(frame).await
    }

    /// Runs one heartbeat round.
    ///
    /// An unanswered ping from the previous round counts as missed; enough
    /// misses degrade, then drop, the connection.
    pub async fn heartbeat(self: &Arc<Self>) {
        let now = Instant::now();
        let mut pings = Vec::new();
        let mut dropped = Vec::new();
        {
            let mut slots = self.slots.write();
            for slot in slots.values_mut() {
                let Some(sink) = slot.sink.clone() else {
                    continue;
                };
                if !slot.record.state.is_healthy() {
                    continue;
                }
                let id = slot.record.id;

                if slot.outstanding_ping.is_some() {
                    slot.record.missed_heartbeats += 1;
                    let missed = slot.record.missed_heartbeats;
                    if missed >= self.heartbeat.disconnect_after_missed {
                        warn!(connection = %id, missed, "heartbeat lost, dropping connection");
                        slot.sink = None;
                        slot.outstanding_ping = None;
                        slot.generation += 1;
                        self.set_state(slot, ConnectionState::Disconnected);
                        dropped.push((id, sink));
                        continue;
                    }
                    if missed >= self.heartbeat.degrade_after_missed
                        && slot.record.state == ConnectionState::Connected
                    {
                        self.set_state(slot, ConnectionState::Degraded);
                    }
                }

                let nonce = self.nonce.fetch_add(1, Ordering::Relaxed) + 1;
                slot.outstanding_ping = Some((nonce, now));
                pings.push((id, sink, Heartbeat::new(id, nonce, unix_millis())));
            }
        }

        for (id, sink, heartbeat) in pings {
            let sent = match encode(&Message::Ping(heartbeat)) {
                Ok(bytes) => sink.send(bytes).await,
                Err(err) => Err(err),
            };
            if let Err(err) = sent {
                debug!(connection = %id, error = %err, "ping not sent");
            }
        }

        for (id, sink) in dropped {
            sink.close().await;
            self.emit(PoolEvent::Closed {
                connection: id,
                reason: Some("heartbeat timeout".into()),
            });
            self.schedule_reconnect(id);
        }
    }

    /// Records a pong. Returns the round trip if it answered the
    /// outstanding ping.
    pub fn record_pong(&self, id: ConnectionId, nonce: u64, now: Instant) -> Option<Duration> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(&id)?;
        match slot.outstanding_ping {
            Some((expected, sent_at)) if expected == nonce => {
                let rtt = now.saturating_duration_since(sent_at);
                slot.outstanding_ping = None;
                slot.record.missed_heartbeats = 0;
                slot.record.last_heartbeat = Some(now);
                push_sample(&mut slot.record, rtt, self.heartbeat.latency_samples);
                if slot.record.state == ConnectionState::Degraded {
                    self.set_state(slot, ConnectionState::Connected);
                }
                Some(rtt)
            }
            _ => {
                debug!(connection = %id, nonce, "stale pong ignored");
                None
            }
        }
    }

    /// Pool-wide health.
    pub fn health(&self) -> ConnectionHealth {
        let slots = self.slots.read();
        let healthy: Vec<&Slot> = slots
            .values()
            .filter(|slot| slot.record.state.is_healthy())
            .collect();
        let averages: Vec<Duration> = healthy
            .iter()
            .filter_map(|slot| slot.record.avg_latency())
            .collect();
        let avg_latency = if averages.is_empty() {
            None
        } else {
            Some(averages.iter().sum::<Duration>() / averages.len() as u32)
        };

        ConnectionHealth {
            avg_latency,
            healthy_connections: healthy.len(),
            total_connections: slots.len(),
        }
    }

    /// Best state across the pool.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::best(self.slots.read().values().map(|slot| slot.record.state))
    }

    /// Returns true if any connection can carry traffic.
    pub fn has_healthy(&self) -> bool {
        self.slots
            .read()
            .values()
            .any(|slot| slot.record.state.is_healthy() && slot.sink.is_some())
    }

    /// Copies of every connection record.
    pub fn records(&self) -> Vec<ConnectionRecord> {
        self.slots
            .read()
            .values()
            .map(|slot| slot.record.clone())
            .collect()
    }

    /// Copy of one connection record.
    pub fn record(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.slots.read().get(&id).map(|slot| slot.record.clone())
    }

    /// Closes every link and forgets every record.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let sinks: Vec<Arc<dyn FrameSink>> = {
            let mut slots = self.slots.write();
            let sinks = slots.values_mut().filter_map(|slot| slot.sink.take()).collect();
            slots.clear();
            sinks
        };
        for sink in sinks {
            sink.close().await;
        }
        info!("connection pool shut down");
    }

    async fn attempt(self: &Arc<Self>, id: ConnectionId, reconnect: bool) -> SyncResult<()> {
        if reconnect {
            self.stats.record_reconnect_attempt();
        }

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SyncError::Shutdown),
            result = tokio::time::timeout(self.config.connect_timeout, self.connector.connect(id)) => {
                result.unwrap_or(Err(SyncError::Timeout))
            }
        };

        match connected {
            Ok(link) => {
                if self.cancel.is_cancelled() {
                    link.sink.close().await;
                    return Err(SyncError::Shutdown);
                }
                self.on_connected(id, link, reconnect);
                Ok(())
            }
            Err(err) => {
                self.on_connect_failed(id, &err);
                Err(err)
            }
        }
    }

    fn on_connected(self: &Arc<Self>, id: ConnectionId, link: TransportLink, reconnect: bool) {
        let TransportLink { sink, stream } = link;
        let generation = {
            let mut slots = self.slots.write();
            if !slots.contains_key(&id) {
                self.insert_slot(&mut slots, id, ConnectionState::Connecting);
            }
            let Some(slot) = slots.get_mut(&id) else {
                return;
            };
            slot.generation += 1;
            slot.sink = Some(sink);
            slot.outstanding_ping = None;
            slot.record.consecutive_failures = 0;
            slot.record.missed_heartbeats = 0;
            slot.record.last_heartbeat = Some(Instant::now());
            self.set_state(slot, ConnectionState::Connected);
            slot.generation
        };

        info!(connection = %id, reconnect, "connection established");
        self.emit(PoolEvent::Connected {
            connection: id,
            reconnect,
        });
        tokio::spawn(Arc::clone(self).read_loop(id, generation, stream));
    }

    fn on_connect_failed(self: &Arc<Self>, id: ConnectionId, err: &SyncError) {
        let give_up = {
            let mut slots = self.slots.write();
            let Some(slot) = slots.get_mut(&id) else {
                return;
            };
            slot.record.consecutive_failures += 1;
            let failures = slot.record.consecutive_failures;
            warn!(connection = %id, failures, error = %err, "connect attempt failed");
            if !err.is_retryable() || failures >= self.retry.max_attempts {
                self.set_state(slot, ConnectionState::Failed);
                true
            } else {
                false
            }
        };

        if give_up {
            warn!(connection = %id, "reconnect attempts exhausted, manual reconnect required");
        } else {
            self.schedule_reconnect(id);
        }
    }

    async fn read_loop(self: Arc<Self>, id: ConnectionId, generation: u64, mut stream: Box<dyn FrameStream>) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = stream.recv() => next,
            };
            if !self.is_current(id, generation) {
                return;
            }
            match next {
                Ok(Some(bytes)) => self.emit(PoolEvent::Frame {
                    connection: id,
                    bytes,
                }),
                Ok(None) => {
                    self.on_link_lost(id, generation, None).await;
                    return;
                }
                Err(err) => {
                    self.on_link_lost(id, generation, Some(err.to_string())).await;
                    return;
                }
            }
        }
    }

    async fn on_link_lost(self: &Arc<Self>, id: ConnectionId, generation: u64, reason: Option<String>) {
        let sink = {
            let mut slots = self.slots.write();
            let Some(slot) = slots.get_mut(&id) else {
                return;
            };
            if slot.generation != generation || !slot.record.state.is_healthy() {
                return;
            }
            slot.outstanding_ping = None;
            self.set_state(slot, ConnectionState::Disconnected);
            slot.sink.take()
        };

        warn!(connection = %id, reason = reason.as_deref().unwrap_or("closed by peer"), "connection lost");
        if let Some(sink) = sink {
            sink.close().await;
        }
        self.emit(PoolEvent::Closed {
            connection: id,
            reason,
        });
        self.schedule_reconnect(id);
    }

    fn schedule_reconnect(self: &Arc<Self>, id: ConnectionId) {
        if self.cancel.is_cancelled() {
            return;
        }
        let delay = {
            let mut slots = self.slots.write();
            let Some(slot) = slots.get_mut(&id) else {
                return;
            };
            self.set_state(slot, ConnectionState::Reconnecting);
            self.retry
                .delay_for_attempt(slot.record.consecutive_failures.saturating_add(1))
        };
        debug!(connection = %id, ?delay, "reconnect scheduled");

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = pool.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // An explicit reconnect or shutdown may have raced the timer
            let still_waiting = pool
                .slots
                .read()
                .get(&id)
                .is_some_and(|slot| slot.record.state == ConnectionState::Reconnecting && slot.sink.is_none());
            if still_waiting {
                let _ = pool.attempt(id, true).await;
            }
        });
    }

    fn is_current(&self, id: ConnectionId, generation: u64) -> bool {
        self.slots
            .read()
            .get(&id)
            .is_some_and(|slot| slot.generation == generation)
    }

    fn insert_slot(
        &self,
        slots: &mut BTreeMap<ConnectionId, Slot>,
        id: ConnectionId,
        state: ConnectionState,
    ) {
        self.record_transition(id, None, state);
        slots.entry(id).or_insert_with(|| Slot {
            record: ConnectionRecord::new(id, state),
            sink: None,
            outstanding_ping: None,
            generation: 0,
        });
    }

    fn set_state(&self, slot: &mut Slot, to: ConnectionState) {
        let from = slot.record.state;
        if from == to {
            return;
        }
        slot.record.state = to;
        self.record_transition(slot.record.id, Some(from), to);
    }

    fn record_transition(&self, connection: ConnectionId, from: Option<ConnectionState>, to: ConnectionState) {
        let transition = StateTransition {
            connection,
            from,
            to,
            at: unix_millis(),
        };
        debug!(%connection, ?from, %to, "connection state changed");
        self.stats.record_transition(transition);
        self.emit(PoolEvent::Transition(transition));
    }

    fn emit(&self, event: PoolEvent) {
        // The receiver is gone only after shutdown
        let _ = self.events.send(event);
    }

    #[cfg(test)]
    fn record_latency(&self, id: ConnectionId, sample: Duration) {
        if let Some(slot) = self.slots.write().get_mut(&id) {
            push_sample(&mut slot.record, sample, self.heartbeat.latency_samples);
        }
    }
}

fn push_sample(record: &mut ConnectionRecord, sample: Duration, limit: usize) {
    if record.latency_samples.len() >= limit.max(1) {
        record.latency_samples.pop_front();
    }
    record.latency_samples.push_back(sample);
}

pub(crate) fn encode(message: &Message) -> SyncResult<Vec<u8>> {
    encode_with(message, false)
}

pub(crate) fn encode_with(message: &Message, compressed: bool) -> SyncResult<Vec<u8>> {
    Ok(Frame::from_message(message, compressed)?.to_bytes()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryServer;
    use crate::state::HealthClass;

    const C1: ConnectionId = ConnectionId::new(1);
    const C2: ConnectionId = ConnectionId::new(2);

    fn config(size: usize) -> SyncConfig {
        SyncConfig::new()
            .with_pool(PoolConfig::new(size))
            .with_retry(
                RetryConfig::new(3)
                    .with_initial_delay(Duration::from_millis(10))
                    .with_jitter(false),
            )
            .with_heartbeat(HeartbeatConfig::new(Duration::from_secs(1)).with_thresholds(1, 3))
    }

    fn pool(
        server: &MemoryServer,
        size: usize,
    ) -> (
        Arc<ConnectionPool<crate::memory::MemoryConnector>>,
        mpsc::UnboundedReceiver<PoolEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(
            server.connector(),
            &config(size),
            Arc::new(StatsAggregator::new()),
            tx,
            CancellationToken::new(),
        );
        (pool, rx)
    }

    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<PoolEvent>, mut pred: F) -> PoolEvent
    where
        F: FnMut(&PoolEvent) -> bool,
    {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
                .await
                .expect("timed out waiting for pool event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    fn is_state(event: &PoolEvent, state: ConnectionState) -> bool {
        matches!(event, PoolEvent::Transition(t) if t.to == state)
    }

    #[tokio::test]
    async fn connect_brings_pool_up() {
        let server = MemoryServer::new();
        let (pool, mut rx) = pool(&server, 2);

        pool.connect().await.unwrap();
        assert_eq!(pool.state(), ConnectionState::Connected);
        assert!(pool.has_healthy());
        assert_eq!(pool.health().healthy_connections, 2);
        assert_eq!(pool.health().total_connections, 2);

        let first = wait_for(&mut rx, |_| true).await;
        match first {
            PoolEvent::Transition(t) => {
                assert_eq!(t.from, None);
                assert_eq!(t.to, ConnectionState::Connecting);
            }
            other => panic!("unexpected {other:?}"),
        }
        wait_for(&mut rx, |e| matches!(e, PoolEvent::Connected { reconnect: false, .. })).await;
    }

    #[tokio::test]
    async fn frames_are_forwarded() {
        let server = MemoryServer::new();
        let (pool, mut rx) = pool(&server, 1);
        pool.connect().await.unwrap();

        server.send_raw(C1, vec![1, 2, 3]).unwrap();
        let event = wait_for(&mut rx, |e| matches!(e, PoolEvent::Frame { .. })).await;
        assert_eq!(
            event,
            PoolEvent::Frame {
                connection: C1,
                bytes: vec![1, 2, 3]
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_link_reconnects() {
        let server = MemoryServer::new();
        let (pool, mut rx) = pool(&server, 1);
        pool.connect().await.unwrap();

        server.drop_connection(C1);
        wait_for(&mut rx, |e| matches!(e, PoolEvent::Closed { .. })).await;
        wait_for(&mut rx, |e| matches!(e, PoolEvent::Connected { reconnect: true, .. })).await;

        assert_eq!(pool.state(), ConnectionState::Connected);
        assert!(server.is_linked(C1));
        assert_eq!(pool.stats.snapshot().reconnect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_until_explicit_reconnect() {
        let server = MemoryServer::new();
        server.set_offline(true);
        let (pool, mut rx) = pool(&server, 1);

        assert!(matches!(
            pool.connect().await,
            Err(SyncError::ConnectionFailed { .. })
        ));
        wait_for(&mut rx, |e| is_state(e, ConnectionState::Failed)).await;

        // No silent retries once failed
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(server.connect_attempts(), 3);
        assert!(pool.state().requires_intervention());
        assert_eq!(pool.record(C1).unwrap().consecutive_failures, 3);

        server.set_offline(false);
        assert_eq!(pool.reconnect_failed().await, 1);
        assert_eq!(pool.state(), ConnectionState::Connected);
        assert_eq!(pool.record(C1).unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn explicit_reconnect_rejects_live_connection() {
        let server = MemoryServer::new();
        let (pool, _rx) = pool(&server, 1);
        pool.connect().await.unwrap();
        assert!(matches!(
            pool.reconnect(C1).await,
            Err(SyncError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeats_degrade_then_drop() {
        let server = MemoryServer::new();
        server.set_auto_pong(false);
        let (pool, mut rx) = pool(&server, 1);
        pool.connect().await.unwrap();

        pool.heartbeat().await;
        assert_eq!(pool.state(), ConnectionState::Connected);
        assert_eq!(server.pings_received(), 1);

        pool.heartbeat().await;
        assert_eq!(pool.state(), ConnectionState::Degraded);
        assert!(pool.has_healthy());

        pool.heartbeat().await;
        assert_eq!(pool.record(C1).unwrap().missed_heartbeats, 2);

        pool.heartbeat().await;
        wait_for(&mut rx, |e| is_state(e, ConnectionState::Disconnected)).await;
        wait_for(&mut rx, |e| matches!(e, PoolEvent::Connected { reconnect: true, .. })).await;
        assert_eq!(pool.record(C1).unwrap().missed_heartbeats, 0);
    }

    #[tokio::test]
    async fn pong_restores_connected_and_samples_latency() {
        let server = MemoryServer::new();
        server.set_auto_pong(false);
        let (pool, _rx) = pool(&server, 1);
        pool.connect().await.unwrap();

        pool.heartbeat().await;
        pool.heartbeat().await;
        assert_eq!(pool.state(), ConnectionState::Degraded);

        let nonce = pool.slots.read()[&C1].outstanding_ping.unwrap().0;
        assert_eq!(pool.record_pong(C1, nonce - 1, Instant::now()), None);
        assert!(pool.record_pong(C1, nonce, Instant::now()).is_some());

        let record = pool.record(C1).unwrap();
        assert_eq!(record.state, ConnectionState::Connected);
        assert_eq!(record.missed_heartbeats, 0);
        assert_eq!(record.latency_samples.len(), 1);
    }

    #[tokio::test]
    async fn send_prefers_lowest_latency() {
        let server = MemoryServer::new();
        let (pool, _rx) = pool(&server, 2);
        pool.connect().await.unwrap();

        pool.record_latency(C1, Duration::from_millis(200));
        pool.record_latency(C2, Duration::from_millis(20));

        let ping = encode(&Message::Ping(Heartbeat::new(C2, 1, 0))).unwrap();
        assert_eq!(pool.send(ping).await.unwrap(), C2);

        let health = pool.health();
        assert_eq!(health.avg_latency, Some(Duration::from_millis(110)));
        assert_eq!(health.class(), HealthClass::Good);
    }

    #[tokio::test]
    async fn latency_window_is_bounded() {
        let server = MemoryServer::new();
        let (pool, _rx) = pool(&server, 1);
        pool.connect().await.unwrap();
        for ms in 1..=40 {
            pool.record_latency(C1, Duration::from_millis(ms));
        }
        let record = pool.record(C1).unwrap();
        assert_eq!(record.latency_samples.len(), crate::config::DEFAULT_LATENCY_SAMPLES);
        assert_eq!(record.latency_samples.front(), Some(&Duration::from_millis(25)));
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let server = MemoryServer::new();
        let (pool, _rx) = pool(&server, 1);
        assert_eq!(pool.send(vec![0]).await, Err(SyncError::NotConnected));
        assert_eq!(pool.state(), ConnectionState::Disconnected);
        assert_eq!(pool.health().class(), HealthClass::Offline);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let server = MemoryServer::new();
        let (pool, _rx) = pool(&server, 2);
        pool.connect().await.unwrap();

        pool.shutdown().await;
        assert!(pool.records().is_empty());
        assert!(!server.is_linked(C1));
        assert!(!server.is_linked(C2));
        assert!(matches!(pool.connect().await, Err(SyncError::Shutdown)));
    }
}
