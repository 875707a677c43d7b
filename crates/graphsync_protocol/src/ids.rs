//! Identifiers shared by every layer.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Identifier of a transport connection.
///
/// Sequence numbers are scoped to a connection. `ConnectionId::LOCAL`
/// is reserved for client-originated optimistic writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// The connection id stamped on local optimistic writes.
    pub const LOCAL: ConnectionId = ConnectionId(0);

    /// Creates a connection id.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns true for the reserved local writer id.
    pub const fn is_local(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "local")
        } else {
            write!(f, "conn-{}", self.0)
        }
    }
}

/// Identifier of a node or link.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Creates an entity id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The `(connection, sequence)` pair that last touched a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeqStamp {
    /// Source connection.
    pub connection: ConnectionId,
    /// Sequence number within that connection.
    pub sequence: u64,
}

impl SeqStamp {
    /// Creates a stamp.
    pub const fn new(connection: ConnectionId, sequence: u64) -> Self {
        Self {
            connection,
            sequence,
        }
    }

    /// Returns true if an op with this `(connection, sequence)` has already
    /// been reflected by this stamp.
    ///
    /// Stamps from different connections are never comparable.
    pub fn covers(&self, connection: ConnectionId, sequence: u64) -> bool {
        self.connection == connection && sequence <= self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_display() {
        assert_eq!(ConnectionId::LOCAL.to_string(), "local");
        assert_eq!(ConnectionId::new(3).to_string(), "conn-3");
        assert!(ConnectionId::LOCAL.is_local());
        assert!(!ConnectionId::new(1).is_local());
    }

    #[test]
    fn stamp_covers_same_connection_only() {
        let stamp = SeqStamp::new(ConnectionId::new(1), 10);
        assert!(stamp.covers(ConnectionId::new(1), 10));
        assert!(stamp.covers(ConnectionId::new(1), 3));
        assert!(!stamp.covers(ConnectionId::new(1), 11));
        assert!(!stamp.covers(ConnectionId::new(2), 1));
    }

    #[test]
    fn entity_id_conversions() {
        let a = EntityId::from("n1");
        let b = EntityId::new(String::from("n1"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "n1");
        assert_eq!(a.to_string(), "n1");
    }
}
