//! Connection state machine and health classification.

use graphsync_protocol::ConnectionId;
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// Rolling-average latency below which a connection is excellent.
pub const EXCELLENT_LATENCY: Duration = Duration::from_millis(50);
/// Rolling-average latency below which a connection is good.
pub const GOOD_LATENCY: Duration = Duration::from_millis(150);
/// Rolling-average latency below which a connection is fair.
pub const FAIR_LATENCY: Duration = Duration::from_millis(300);

/// The state of one pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// First connect attempt in flight.
    Connecting,
    /// Link up and heartbeats answered.
    Connected,
    /// Link up but heartbeats are being missed.
    Degraded,
    /// Waiting for or running a reconnect attempt.
    Reconnecting,
    /// No link and no attempt scheduled.
    Disconnected,
    /// Reconnect attempts exhausted; needs an explicit reconnect.
    Failed,
}

impl ConnectionState {
    /// Returns true if the connection can carry traffic.
    pub fn is_healthy(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }

    /// Returns true if an attempt is in flight or scheduled.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    /// Returns true if automatic recovery has stopped.
    pub fn requires_intervention(&self) -> bool {
        matches!(self, ConnectionState::Failed)
    }

    /// Returns true if an explicit reconnect may start from this state.
    pub fn can_reconnect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed
        )
    }

    /// Ordering used to pick the best state across the pool.
    fn rank(&self) -> u8 {
        match self {
            ConnectionState::Connected => 5,
            ConnectionState::Degraded => 4,
            ConnectionState::Connecting => 3,
            ConnectionState::Reconnecting => 2,
            ConnectionState::Disconnected => 1,
            ConnectionState::Failed => 0,
        }
    }

    /// Best state across a set of connections; `Disconnected` when empty.
    pub fn best<I: IntoIterator<Item = ConnectionState>>(states: I) -> ConnectionState {
        states
            .into_iter()
            .max_by_key(ConnectionState::rank)
            .unwrap_or(ConnectionState::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Coarse health class derived from latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthClass {
    /// Below 50 ms.
    Excellent,
    /// Below 150 ms.
    Good,
    /// Below 300 ms.
    Fair,
    /// 300 ms or more.
    Poor,
    /// No healthy connection.
    Offline,
}

/// Pool-wide connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionHealth {
    /// Mean of the healthy connections' rolling averages, if any samples exist.
    #[serde(rename = "avg_latency_ms", serialize_with = "latency_millis")]
    pub avg_latency: Option<Duration>,
    /// Connections in `connected` or `degraded`.
    pub healthy_connections: usize,
    /// All tracked connections.
    pub total_connections: usize,
}

impl ConnectionHealth {
    /// Classifies this health snapshot.
    ///
    /// Healthy connections without latency samples yet count as `Good`.
    pub fn class(&self) -> HealthClass {
        if self.healthy_connections == 0 {
            return HealthClass::Offline;
        }
        match self.avg_latency {
            None => HealthClass::Good,
            Some(latency) if latency < EXCELLENT_LATENCY => HealthClass::Excellent,
            Some(latency) if latency < GOOD_LATENCY => HealthClass::Good,
            Some(latency) if latency < FAIR_LATENCY => HealthClass::Fair,
            Some(_) => HealthClass::Poor,
        }
    }
}

fn latency_millis<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(latency) => serializer.serialize_some(&(latency.as_secs_f64() * 1000.0)),
        None => serializer.serialize_none(),
    }
}

/// A recorded connection state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    /// Connection that changed.
    pub connection: ConnectionId,
    /// Previous state; `None` for a newly created record.
    pub from: Option<ConnectionState>,
    /// New state.
    pub to: ConnectionState,
    /// Wall clock time of the change in milliseconds.
    pub at: u64,
}
