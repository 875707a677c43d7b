//! Configuration for the sync engine.

use graphsync_protocol::ConnectionId;
use rand::Rng;
use std::time::Duration;

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: usize = 1;
/// Default bound on a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default interval between heartbeat pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Default number of latency samples kept per connection.
pub const DEFAULT_LATENCY_SAMPLES: usize = 16;
/// Default reorder window (positions past the next expected sequence).
pub const DEFAULT_REORDER_WINDOW: u64 = 64;
/// Default time a sequence gap may stay open before a resync.
pub const DEFAULT_REORDER_TIMEOUT: Duration = Duration::from_secs(2);
/// Default lifetime of a dedup entry.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(60);
/// Default number of dedup entries kept.
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;
/// Default offline queue bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
/// Default interval of the timeout sweep.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(16);
/// Default time a removal tombstone is kept, in writer clock time.
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(600);
/// Default number of tombstones kept per entity kind.
pub const DEFAULT_MAX_TOMBSTONES: usize = 10_000;

/// Top-level configuration for a [`SyncCoordinator`](crate::SyncCoordinator).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Connection pool settings.
    pub pool: PoolConfig,
    /// Heartbeat settings.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff settings.
    pub retry: RetryConfig,
    /// Dedup and reorder settings.
    pub ingress: IngressConfig,
    /// Offline queue settings.
    pub queue: QueueConfig,
    /// Conflict resolution settings.
    pub merge: MergeConfig,
    /// Interval of the sweep that expires dedup entries and times out
    /// reorder gaps. Batching does not wait for it: inbound frames already
    /// queued when the event loop wakes are merged as one batch.
    pub tick_interval: Duration,
    /// Whether outgoing frames are lz4-compressed.
    pub compress_outgoing: bool,
    /// Whether a full resync is requested after a reconnect.
    pub resync_on_reconnect: bool,
}

impl SyncConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            pool: PoolConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            retry: RetryConfig::default(),
            ingress: IngressConfig::default(),
            queue: QueueConfig::default(),
            merge: MergeConfig::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            compress_outgoing: false,
            resync_on_reconnect: true,
        }
    }

    /// Sets the pool configuration.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the heartbeat configuration.
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the ingress configuration.
    pub fn with_ingress(mut self, ingress: IngressConfig) -> Self {
        self.ingress = ingress;
        self
    }

    /// Sets the queue configuration.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the merge configuration.
    pub fn with_merge(mut self, merge: MergeConfig) -> Self {
        self.merge = merge;
        self
    }

    /// Sets the timeout sweep interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Enables or disables compression of outgoing frames.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress_outgoing = enabled;
        self
    }

    /// Enables or disables the resync request after a reconnect.
    pub fn with_resync_on_reconnect(mut self, enabled: bool) -> Self {
        self.resync_on_reconnect = enabled;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of connections to keep open (at least one).
    pub size: usize,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
}

impl PoolConfig {
    /// Creates a pool configuration with `size` connections.
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connection ids managed by this pool, `1..=size`.
    pub fn connection_ids(&self) -> impl Iterator<Item = ConnectionId> {
        (1..=self.size.max(1) as u32).map(ConnectionId::new)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

/// Heartbeat settings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub interval: Duration,
    /// Missed pongs after which a connection is degraded.
    pub degrade_after_missed: u32,
    /// Missed pongs after which a connection is dropped.
    pub disconnect_after_missed: u32,
    /// Rolling latency window size.
    pub latency_samples: usize,
}

impl HeartbeatConfig {
    /// Creates a heartbeat configuration with the given interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            degrade_after_missed: 1,
            disconnect_after_missed: 3,
            latency_samples: DEFAULT_LATENCY_SAMPLES,
        }
    }

    /// Sets the missed-pong thresholds.
    pub fn with_thresholds(mut self, degrade_after: u32, disconnect_after: u32) -> Self {
        self.degrade_after_missed = degrade_after;
        self.disconnect_after_missed = disconnect_after.max(degrade_after);
        self
    }

    /// Sets the rolling latency window size.
    pub fn with_latency_samples(mut self, samples: usize) -> Self {
        self.latency_samples = samples.max(1);
        self
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

/// Configuration for reconnect backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Consecutive failed attempts before a connection is marked failed.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that gives up after the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay before retry number `attempt` (1-indexed).
    ///
    /// The result never exceeds `max_delay`, jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        let mut delay_secs = base_delay.min(max_secs);

        if self.add_jitter {
            // Up to 25% on top, still capped
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            delay_secs = (delay_secs + jitter).min(max_secs);
        }

        Duration::from_secs_f64(delay_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Dedup and reorder settings for inbound frames.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// How far past the next expected sequence an arrival may be buffered.
    pub reorder_window: u64,
    /// How long a gap may stay open before a resync is requested.
    pub reorder_timeout: Duration,
    /// Lifetime of a dedup entry.
    pub dedup_ttl: Duration,
    /// Maximum number of dedup entries.
    pub dedup_capacity: usize,
    /// Maximum number of ops buffered per connection while a resync is pending.
    pub resync_buffer_limit: usize,
}

impl IngressConfig {
    /// Creates an ingress configuration with the given reorder window.
    pub fn new(reorder_window: u64) -> Self {
        Self {
            reorder_window,
            reorder_timeout: DEFAULT_REORDER_TIMEOUT,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            resync_buffer_limit: DEFAULT_DEDUP_CAPACITY,
        }
    }

    /// Sets the reorder timeout.
    pub fn with_reorder_timeout(mut self, timeout: Duration) -> Self {
        self.reorder_timeout = timeout;
        self
    }

    /// Sets the dedup window.
    pub fn with_dedup(mut self, ttl: Duration, capacity: usize) -> Self {
        self.dedup_ttl = ttl;
        self.dedup_capacity = capacity.max(1);
        self
    }

    /// Sets the buffer limit while waiting for a resync.
    pub fn with_resync_buffer_limit(mut self, limit: usize) -> Self {
        self.resync_buffer_limit = limit;
        self
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REORDER_WINDOW)
    }
}

/// Offline queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of queued writes.
    pub capacity: usize,
    /// Flush automatically when a healthy connection comes back.
    pub auto_flush: bool,
}

impl QueueConfig {
    /// Creates a queue configuration with the given bound.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            auto_flush: true,
        }
    }

    /// Enables or disables the automatic flush on reconnect.
    pub fn with_auto_flush(mut self, enabled: bool) -> Self {
        self.auto_flush = enabled;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Conflict resolution and tombstone settings.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Connection priority for timestamp/sequence ties, highest first.
    ///
    /// Unlisted connections rank below listed ones, lower id first.
    pub connection_priority: Vec<ConnectionId>,
    /// How long a tombstone outlives its removal, measured against the
    /// newest op timestamp the merger has applied.
    pub tombstone_ttl: Duration,
    /// Upper bound on tombstones per entity kind; the oldest go first.
    pub max_tombstones: usize,
}

impl MergeConfig {
    /// Creates a merge configuration with the given priority order.
    pub fn with_priority(connection_priority: Vec<ConnectionId>) -> Self {
        Self {
            connection_priority,
            ..Self::default()
        }
    }

    /// Sets how long tombstones are kept.
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    /// Sets the tombstone bound.
    pub fn with_max_tombstones(mut self, max: usize) -> Self {
        self.max_tombstones = max;
        self
    }

    /// Rank of a connection; lower ranks win ties.
    pub fn rank(&self, connection: ConnectionId) -> (usize, u32) {
        match self
            .connection_priority
            .iter()
            .position(|c| *c == connection)
        {
            Some(index) => (index, 0),
            None => (self.connection_priority.len(), connection.as_u32()),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            connection_priority: Vec::new(),
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
            max_tombstones: DEFAULT_MAX_TOMBSTONES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_pool(PoolConfig::new(3).with_connect_timeout(Duration::from_secs(2)))
            .with_queue(QueueConfig::new(10).with_auto_flush(false))
            .with_tick_interval(Duration::from_millis(5))
            .with_compression(true);

        assert_eq!(config.pool.size, 3);
        assert_eq!(config.pool.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.queue.capacity, 10);
        assert!(!config.queue.auto_flush);
        assert_eq!(config.tick_interval, Duration::from_millis(5));
        assert!(config.compress_outgoing);
        assert!(config.resync_on_reconnect);
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.pool.size, 1);
        assert_eq!(config.heartbeat.interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat.degrade_after_missed, 1);
        assert_eq!(config.heartbeat.disconnect_after_missed, 3);
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.ingress.reorder_window, 64);
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.tick_interval, Duration::from_millis(16));
        assert_eq!(config.merge.tombstone_ttl, Duration::from_secs(600));
        assert_eq!(config.merge.max_tombstones, 10_000);
    }

    #[test]
    fn pool_ids_start_at_one() {
        let ids: Vec<_> = PoolConfig::new(3).connection_ids().collect();
        assert_eq!(
            ids,
            vec![ConnectionId::new(1), ConnectionId::new(2), ConnectionId::new(3)]
        );
        assert_eq!(PoolConfig::new(0).size, 1);
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
        assert!(delay2 <= Duration::from_millis(250));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        for attempt in 1..40 {
            assert!(config.delay_for_attempt(attempt) <= Duration::from_secs(5));
        }
    }

    #[test]
    fn retry_delay_without_jitter_is_exact() {
        let config = RetryConfig::new(4)
            .with_initial_delay(Duration::from_millis(250))
            .with_jitter(false);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(1000));
    }

    #[test]
    fn priority_rank() {
        let merge = MergeConfig::with_priority(vec![ConnectionId::new(2), ConnectionId::new(1)]);
        assert!(merge.rank(ConnectionId::new(2)) < merge.rank(ConnectionId::new(1)));
        assert!(merge.rank(ConnectionId::new(1)) < merge.rank(ConnectionId::new(3)));
        assert!(merge.rank(ConnectionId::new(3)) < merge.rank(ConnectionId::new(4)));

        let unlisted = MergeConfig::default();
        assert!(unlisted.rank(ConnectionId::LOCAL) < unlisted.rank(ConnectionId::new(1)));
    }
}
