//! The composition root.
//!
//! [`SyncCoordinator`] wires the pool, ingress, merger and offline queue
//! together. Every inbound frame from every connection funnels through one
//! event-loop task, so snapshot mutation has a single logical writer and
//! subscribers see versions in strictly increasing order.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::ingress::{Ingested, MessageIngress};
use crate::merger::{BatchOutcome, ChangeSet, DeltaMerger};
use crate::pool::{encode_with, ConnectionPool, PoolEvent};
use crate::queue::{OfflineQueue, QueueStatus};
use crate::snapshot::GraphSnapshot;
use crate::state::{ConnectionHealth, ConnectionState};
use crate::stats::{ConnectionSummary, DetailedStats, StatsAggregator, SyncStats};
use crate::transport::Connector;
use crate::unix_millis;
use graphsync_protocol::{ConnectionId, DeltaBody, DeltaOp, Message, ResyncSnapshot};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Most pool events folded into one merge batch.
const MAX_EVENT_BATCH: usize = 256;

/// One atomic snapshot-version update delivered to subscribers.
#[derive(Debug, Clone)]
pub struct SnapshotUpdate {
    /// The new version.
    pub version: u64,
    /// The snapshot at that version.
    pub snapshot: Arc<GraphSnapshot>,
    /// What changed since the previous version.
    pub changes: ChangeSet,
}

/// Where a submitted write went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Sent on this connection.
    Sent(ConnectionId),
    /// Held in the offline queue.
    Queued,
}

/// Result of a queue flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries sent and acknowledged.
    pub sent: usize,
    /// Entries still queued afterwards.
    pub remaining: usize,
}

type Callback = Arc<dyn Fn(&SnapshotUpdate) + Send + Sync>;

struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    fn add(self: &Arc<Self>, callback: Callback) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.push(Subscriber {
            id,
            active: Arc::clone(&active),
            callback,
        });
        Subscription {
            id,
            active,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        self.inner.lock().subscribers.retain(|s| s.id != id);
    }

    fn len(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    fn notify(&self, update: &SnapshotUpdate) {
        // Callbacks run without the registry lock so they may subscribe or
        // unsubscribe themselves
        let targets: Vec<(Arc<AtomicBool>, Callback)> = self
            .inner
            .lock()
            .subscribers
            .iter()
            .map(|s| (Arc::clone(&s.active), Arc::clone(&s.callback)))
            .collect();
        for (active, callback) in targets {
            if active.load(Ordering::Acquire) {
                callback(update);
            }
        }
    }
}

/// Handle of a snapshot subscription.
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Stops further deliveries. Does not touch the connection.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Returns true until unsubscribed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn detach(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

struct Shared<C: Connector> {
    config: SyncConfig,
    pool: Arc<ConnectionPool<C>>,
    ingress: Mutex<MessageIngress>,
    merger: Mutex<DeltaMerger>,
    queue: Mutex<OfflineQueue>,
    stats: Arc<StatsAggregator>,
    registry: Arc<Registry>,
    /// Held from merge to the last callback so versions publish in order.
    publish_lock: Mutex<()>,
    cancel: CancellationToken,
}

/// Clears the queue's syncing flag however the flush ends.
struct FlushGuard<'a>(&'a Mutex<OfflineQueue>);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().end_sync();
    }
}

impl<C: Connector> Shared<C> {
    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PoolEvent>) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let mut batch = vec![event];
                    while batch.len() < MAX_EVENT_BATCH {
                        match events.try_recv() {
                            Ok(event) => batch.push(event),
                            Err(_) => break,
                        }
                    }
                    self.handle_events(batch).await;
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }
        debug!("event loop stopped");
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = self.config.heartbeat.interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => self.pool.heartbeat().await,
            }
        }
    }

    async fn handle_events(self: &Arc<Self>, events: Vec<PoolEvent>) {
        let now = Instant::now();
        let mut ops: Vec<DeltaOp> = Vec::new();
        let mut outbound: Vec<(ConnectionId, Message)> = Vec::new();
        let mut link_up = false;

        for event in events {
            match event {
                PoolEvent::Frame { connection, bytes } => {
                    let ingested = self.ingress.lock().ingest(&bytes, now);
                    match ingested {
                        Ingested::Ops(ready) => ops.extend(ready),
                        Ingested::Snapshot { snapshot, then } => {
                            // Earlier ops go first so the snapshot supersedes them
                            self.apply(std::mem::take(&mut ops));
                            self.install(&snapshot);
                            ops.extend(then);
                        }
                        Ingested::Resync(request) => {
                            outbound.push((request.connection_id, Message::ResyncRequest(request)));
                        }
                        Ingested::Ping(heartbeat) => {
                            outbound.push((connection, Message::Pong(heartbeat)));
                        }
                        Ingested::Pong(heartbeat) => {
                            self.pool.record_pong(connection, heartbeat.nonce, now);
                        }
                        Ingested::Duplicate | Ingested::Buffered | Ingested::Dropped(_) => {}
                    }
                }
                PoolEvent::Connected {
                    connection,
                    reconnect,
                } => {
                    self.apply(std::mem::take(&mut ops));
                    self.merger.lock().forget_connection(connection);
                    let request = {
                        let mut ingress = self.ingress.lock();
                        ingress.reset_stream(connection);
                        if reconnect && self.config.resync_on_reconnect {
                            ingress.request_resync(connection)
                        } else {
                            None
                        }
                    };
                    if let Some(request) = request {
                        outbound.push((connection, Message::ResyncRequest(request)));
                    }
                    link_up = true;
                }
                PoolEvent::Closed { connection, reason } => {
                    debug!(%connection, ?reason, "link closed");
                }
                PoolEvent::Transition(_) => {}
            }
        }
        self.apply(ops);

        for (connection, message) in outbound {
            self.send_control(connection, &message).await;
        }

        if link_up && self.config.queue.auto_flush && !self.queue.lock().is_empty() {
            self.spawn_flush();
        }
    }

    async fn on_tick(&self) {
        let requests = self.ingress.lock().poll_timeouts(Instant::now());
        for request in requests {
            self.send_control(request.connection_id, &Message::ResyncRequest(request))
                .await;
        }
    }

    async fn send_control(&self, connection: ConnectionId, message: &Message) {
        let sent = match encode_with(message, self.config.compress_outgoing) {
            Ok(bytes) => self.pool.send_to(connection, bytes).await,
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            warn!(%connection, kind = %message.kind(), error = %err, "control message not sent");
        }
    }

    fn apply(&self, ops: Vec<DeltaOp>) {
        if ops.is_empty() {
            return;
        }
        let _publishing = self.publish_lock.lock();
        let (outcome, snapshot) = {
            let mut merger = self.merger.lock();
            let outcome = merger.apply_batch(&ops);
            (outcome, merger.snapshot())
        };
        self.publish(outcome, snapshot);
    }

    fn install(&self, resync: &ResyncSnapshot) {
        let _publishing = self.publish_lock.lock();
        let unacknowledged: Vec<DeltaOp> = self.queue.lock().iter().map(|e| e.op.clone()).collect();
        let (outcome, snapshot) = {
            let mut merger = self.merger.lock();
            let outcome = merger.replace_snapshot(resync, &unacknowledged);
            (outcome, merger.snapshot())
        };
        self.publish(outcome, snapshot);
    }

    fn publish(&self, outcome: BatchOutcome, snapshot: Arc<GraphSnapshot>) {
        let Some(version) = outcome.version else {
            return;
        };
        let update = SnapshotUpdate {
            version,
            snapshot,
            changes: outcome.changes,
        };
        self.registry.notify(&update);
    }

    fn enqueue(&self, op: DeltaOp) {
        let dropped = self.queue.lock().enqueue(op, Instant::now());
        if dropped.is_some() {
            self.stats.record_queue_overflow();
        }
    }

    fn spawn_flush(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            match shared.flush().await {
                Ok(report) => debug!(sent = report.sent, remaining = report.remaining, "auto flush finished"),
                Err(SyncError::AlreadySyncing | SyncError::Shutdown) => {}
                Err(err) => warn!(error = %err, "auto flush stopped"),
            }
        });
    }

    async fn flush(&self) -> SyncResult<FlushReport> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Shutdown);
        }
        if !self.pool.has_healthy() {
            return Err(SyncError::NotConnected);
        }
        if !self.queue.lock().begin_sync() {
            return Err(SyncError::AlreadySyncing);
        }
        let _guard = FlushGuard(&self.queue);

        let queued = self.queue.lock().len();
        info!(queued, "flushing offline queue");

        let mut sent = 0;
        loop {
            let next = self.queue.lock().front().cloned();
            let Some(entry) = next else {
                break;
            };
            let bytes = encode_with(&Message::Submit(entry.op.clone()), self.config.compress_outgoing)?;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(SyncError::Shutdown),
                result = self.pool.send(bytes) => result,
            };
            match result {
                Ok(_) => {
                    self.queue.lock().acknowledge(entry.id);
                    sent += 1;
                }
                Err(SyncError::Shutdown) => return Err(SyncError::Shutdown),
                Err(err) => {
                    self.queue.lock().record_failure(entry.id);
                    warn!(entry = entry.id, sent, error = %err, "flush interrupted, entries kept");
                    return Err(err);
                }
            }
        }

        let remaining = self.queue.lock().len();
        info!(sent, remaining, "offline queue flushed");
        Ok(FlushReport { sent, remaining })
    }
}

/// Client-side sync engine.
///
/// Construct with [`new`](Self::new), then [`start`](Self::start) inside a
/// tokio runtime. Consumers read state through [`snapshot`](Self::snapshot)
/// or [`subscribe`](Self::subscribe).
pub struct SyncCoordinator<C: Connector> {
    shared: Arc<Shared<C>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PoolEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Connector> SyncCoordinator<C> {
    /// Builds a coordinator. Nothing connects until `start`.
    pub fn new(connector: C, config: SyncConfig) -> Self {
        let stats = Arc::new(StatsAggregator::new());
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(connector, &config, Arc::clone(&stats), tx, cancel.clone());

        let shared = Shared {
            ingress: Mutex::new(MessageIngress::new(config.ingress.clone(), Arc::clone(&stats))),
            merger: Mutex::new(DeltaMerger::new(config.merge.clone(), Arc::clone(&stats))),
            queue: Mutex::new(OfflineQueue::new(config.queue.capacity)),
            registry: Arc::new(Registry::default()),
            publish_lock: Mutex::new(()),
            config,
            pool,
            stats,
            cancel,
        };

        Self {
            shared: Arc::new(shared),
            events: Mutex::new(Some(rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the event loop and heartbeat, then opens the pool.
    ///
    /// Fails if no connection could be opened; the pool keeps retrying in
    /// the background either way.
    pub async fn start(&self) -> SyncResult<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(SyncError::Shutdown);
        }
        let Some(events) = self.events.lock().take() else {
            return Err(SyncError::InvalidStateTransition {
                from: "started".into(),
                to: "started".into(),
            });
        };

        {
            let mut tasks = self.tasks.lock();
            tasks.push(tokio::spawn(Arc::clone(&self.shared).run(events)));
            tasks.push(tokio::spawn(Arc::clone(&self.shared).heartbeat_loop()));
        }
        info!(
            pool_size = self.shared.config.pool.size,
            "sync coordinator started"
        );
        self.shared.pool.connect().await
    }

    /// Stops every task, aborts flushes and closes every connection.
    ///
    /// Queued entries stay queued.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.pool.shutdown().await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!(queued = self.shared.queue.lock().len(), "sync coordinator stopped");
    }

    /// Explicitly reconnects every failed or disconnected connection.
    ///
    /// Returns how many came back.
    pub async fn reconnect(&self) -> SyncResult<usize> {
        if self.shared.cancel.is_cancelled() {
            return Err(SyncError::Shutdown);
        }
        Ok(self.shared.pool.reconnect_failed().await)
    }

    /// Registers a callback for every new snapshot version.
    ///
    /// Callbacks run on the publishing task in version order, one call per
    /// atomic batch. They may subscribe and unsubscribe, and may read the
    /// coordinator, but must not call [`submit`](Self::submit).
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SnapshotUpdate) + Send + Sync + 'static,
    {
        self.shared.registry.add(Arc::new(callback))
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Applies a client write optimistically, then sends or queues it.
    pub async fn submit(&self, body: DeltaBody) -> SyncResult<SubmitOutcome> {
        self.submit_at(body, unix_millis()).await
    }

    /// Like [`submit`](Self::submit) with an explicit write timestamp.
    pub async fn submit_at(&self, body: DeltaBody, timestamp: u64) -> SyncResult<SubmitOutcome> {
        let shared = &self.shared;
        if shared.cancel.is_cancelled() {
            return Err(SyncError::Shutdown);
        }

        let op = {
            let _publishing = shared.publish_lock.lock();
            let (op, outcome, snapshot) = {
                let mut merger = shared.merger.lock();
                let (op, outcome) = merger.apply_local(body, timestamp);
                (op, outcome, merger.snapshot())
            };
            shared.publish(outcome, snapshot);
            op
        };

        // Direct sends must not overtake queued writes
        let direct = shared.pool.has_healthy() && {
            let queue = shared.queue.lock();
            queue.is_empty() && !queue.is_syncing()
        };
        if direct {
            let bytes = encode_with(&Message::Submit(op.clone()), shared.config.compress_outgoing)?;
            match shared.pool.send(bytes).await {
                Ok(connection) => {
                    debug!(%connection, sequence = op.sequence, "write sent");
                    return Ok(SubmitOutcome::Sent(connection));
                }
                Err(err) => warn!(error = %err, "send failed, queueing write"),
            }
        }

        debug!(sequence = op.sequence, "write queued");
        shared.enqueue(op);
        Ok(SubmitOutcome::Queued)
    }

    /// Flushes the offline queue now.
    ///
    /// Fails with `NotConnected` without a healthy connection and with
    /// `AlreadySyncing` while another flush runs.
    pub async fn force_sync(&self) -> SyncResult<FlushReport> {
        self.shared.flush().await
    }

    /// Discards every queued write without sending. Irreversible.
    pub fn clear_queue(&self) -> usize {
        let discarded = self.shared.queue.lock().clear();
        if discarded > 0 {
            warn!(discarded, "offline queue cleared");
        }
        discarded
    }

    /// Offline queue status.
    pub fn queue_status(&self) -> QueueStatus {
        self.shared.queue.lock().status()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.shared.merger.lock().snapshot()
    }

    /// Best state across the pool.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.pool.state()
    }

    /// Returns true if any connection stopped retrying and waits for
    /// [`reconnect`](Self::reconnect).
    pub fn requires_intervention(&self) -> bool {
        self.shared
            .pool
            .records()
            .iter()
            .any(|record| record.state.requires_intervention())
    }

    /// Pool-wide health.
    pub fn health(&self) -> ConnectionHealth {
        self.shared.pool.health()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SyncStats {
        self.shared.stats.snapshot()
    }

    /// Point-in-time copy of every counter and health figure.
    pub fn detailed_stats(&self) -> DetailedStats {
        let shared = &self.shared;
        let records = shared.pool.records();
        let connection_state = ConnectionState::best(records.iter().map(|r| r.state));
        let requires_intervention = records.iter().any(|r| r.state.requires_intervention());
        let connections = records
            .iter()
            .map(|record| ConnectionSummary {
                id: record.id,
                state: record.state,
                avg_latency_ms: record.avg_latency().map(|d| d.as_secs_f64() * 1000.0),
                consecutive_failures: record.consecutive_failures,
                missed_heartbeats: record.missed_heartbeats,
            })
            .collect();
        let connection_health = shared.pool.health();
        let snapshot = self.snapshot();

        DetailedStats {
            connection_state,
            requires_intervention,
            health_class: connection_health.class(),
            connection_health,
            connections,
            queue_status: self.queue_status(),
            stats: shared.stats.snapshot(),
            snapshot_version: snapshot.version(),
            node_count: snapshot.node_count(),
            link_count: snapshot.link_count(),
            recent_transitions: shared.stats.recent_transitions(),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }
}

impl<C: Connector> Drop for SyncCoordinator<C> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryServer;
    use graphsync_protocol::{AttrValue, Attributes};
    use std::sync::atomic::AtomicUsize;

    fn labelled(label: &str) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("label".into(), AttrValue::from(label));
        attrs
    }

    fn coordinator() -> SyncCoordinator<crate::memory::MemoryConnector> {
        SyncCoordinator::new(MemoryServer::new().connector(), SyncConfig::new())
    }

    #[tokio::test]
    async fn offline_submit_is_applied_and_queued() {
        let coordinator = coordinator();
        let outcome = coordinator
            .submit(DeltaBody::add_node("n1", labelled("A")))
            .await
            .unwrap();

        assert_eq!(outcome, SubmitOutcome::Queued);
        assert_eq!(coordinator.queue_status().queue_size, 1);
        assert_eq!(coordinator.snapshot().version(), 1);
        assert!(coordinator.snapshot().node("n1").is_some());
    }

    #[tokio::test]
    async fn force_sync_requires_connection() {
        let coordinator = coordinator();
        coordinator
            .submit(DeltaBody::add_node("n1", Attributes::new()))
            .await
            .unwrap();
        assert_eq!(coordinator.force_sync().await, Err(SyncError::NotConnected));
        assert_eq!(coordinator.queue_status().queue_size, 1);
        assert!(!coordinator.queue_status().is_syncing);
    }

    #[tokio::test]
    async fn clear_queue_discards() {
        let coordinator = coordinator();
        for id in ["a", "b"] {
            coordinator
                .submit(DeltaBody::add_node(id, Attributes::new()))
                .await
                .unwrap();
        }
        assert_eq!(coordinator.clear_queue(), 2);
        assert_eq!(coordinator.queue_status().queue_size, 0);
        // The optimistic writes stay in the snapshot
        assert_eq!(coordinator.snapshot().node_count(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_each_version_once() {
        let coordinator = coordinator();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = coordinator.subscribe(move |update| sink.lock().push(update.version));

        for id in ["a", "b", "c"] {
            coordinator
                .submit(DeltaBody::add_node(id, Attributes::new()))
                .await
                .unwrap();
        }
        assert_eq!(*seen.lock(), vec![1, 2, 3]);

        subscription.unsubscribe();
        assert_eq!(coordinator.subscriber_count(), 0);
        coordinator
            .submit(DeltaBody::add_node("d", Attributes::new()))
            .await
            .unwrap();
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        {
            let _subscription = coordinator.subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(coordinator.subscriber_count(), 1);
        }
        assert_eq!(coordinator.subscriber_count(), 0);
        coordinator
            .submit(DeltaBody::add_node("a", Attributes::new()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_may_unsubscribe_itself() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let counter = Arc::clone(&calls);
        let own = Arc::clone(&slot);
        let subscription = coordinator.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(subscription) = own.lock().take() {
                subscription.unsubscribe();
            }
        });
        *slot.lock() = Some(subscription);

        for id in ["a", "b"] {
            coordinator
                .submit(DeltaBody::add_node(id, Attributes::new()))
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn callback_may_subscribe_and_read() {
        let coordinator = Arc::new(coordinator());
        let nested: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        let inner = Arc::clone(&coordinator);
        let store = Arc::clone(&nested);
        let _outer = coordinator.subscribe(move |update| {
            assert_eq!(inner.snapshot().version(), update.version);
            if store.lock().is_empty() {
                store.lock().push(inner.subscribe(|_| {}));
            }
        });

        coordinator
            .submit(DeltaBody::add_node("a", Attributes::new()))
            .await
            .unwrap();
        assert_eq!(coordinator.subscriber_count(), 2);
        nested.lock().clear();
    }

    #[tokio::test]
    async fn overflow_is_counted() {
        let config = SyncConfig::new().with_queue(crate::config::QueueConfig::new(2));
        let coordinator = SyncCoordinator::new(MemoryServer::new().connector(), config);
        for id in ["a", "b", "c"] {
            coordinator
                .submit(DeltaBody::add_node(id, Attributes::new()))
                .await
                .unwrap();
        }
        let stats = coordinator.detailed_stats();
        assert_eq!(stats.queue_status.queue_size, 2);
        assert_eq!(stats.queue_status.dropped, 1);
        assert_eq!(stats.stats.queue_overflow_drops, 1);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let coordinator = coordinator();
        coordinator.start().await.unwrap();
        assert!(matches!(
            coordinator.start().await,
            Err(SyncError::InvalidStateTransition { .. })
        ));
        coordinator.shutdown().await;
        assert!(matches!(
            coordinator.submit(DeltaBody::remove_node("a")).await,
            Err(SyncError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn detailed_stats_is_a_copy() {
        let coordinator = coordinator();
        let before = coordinator.detailed_stats();
        coordinator
            .submit(DeltaBody::add_node("a", Attributes::new()))
            .await
            .unwrap();

        assert_eq!(before.snapshot_version, 0);
        assert_eq!(before.connection_state, ConnectionState::Disconnected);
        assert!(!before.requires_intervention);
        assert_eq!(coordinator.detailed_stats().snapshot_version, 1);
    }
}
