//! The versioned client-side graph replica.

use graphsync_protocol::{Attributes, ConnectionId, EntityId, SeqStamp};
use serde::Serialize;
use std::collections::BTreeMap;

/// Write clock of one attribute (or of an entity's creation or removal).
///
/// Clocks order by `(timestamp, sequence)`; ties fall back to connection
/// priority, see [`MergeConfig`](crate::MergeConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WriteClock {
    /// Writer timestamp in milliseconds.
    pub timestamp: u64,
    /// Writer sequence number.
    pub sequence: u64,
    /// Writer connection.
    pub connection: ConnectionId,
}

impl WriteClock {
    /// Creates a clock.
    pub fn new(timestamp: u64, sequence: u64, connection: ConnectionId) -> Self {
        Self {
            timestamp,
            sequence,
            connection,
        }
    }
}

/// Merge bookkeeping shared by nodes and links.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct RecordMeta {
    /// Clock of the last accepted write per attribute key, removals included.
    pub(crate) clocks: BTreeMap<String, WriteClock>,
    /// Clock of the write that created the entity.
    pub(crate) created: Option<WriteClock>,
    /// Highest sequence applied per writer connection.
    pub(crate) seen: BTreeMap<ConnectionId, u64>,
}

impl RecordMeta {
    pub(crate) fn has_seen(&self, connection: ConnectionId, sequence: u64) -> bool {
        self.seen
            .get(&connection)
            .is_some_and(|&last| sequence <= last)
    }

    pub(crate) fn mark_seen(&mut self, connection: ConnectionId, sequence: u64) {
        let last = self.seen.entry(connection).or_insert(0);
        *last = (*last).max(sequence);
    }
}

/// A node in the replica.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRecord {
    /// Node id.
    pub id: EntityId,
    /// Current attributes.
    pub attributes: Attributes,
    /// Stamp of the last op applied to this node.
    pub last_applied: SeqStamp,
    #[serde(skip)]
    pub(crate) meta: RecordMeta,
}

/// A link in the replica.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkRecord {
    /// Link id.
    pub id: EntityId,
    /// Source node id.
    pub source: EntityId,
    /// Target node id.
    pub target: EntityId,
    /// Current attributes.
    pub attributes: Attributes,
    /// Stamp of the last op applied to this link.
    pub last_applied: SeqStamp,
    #[serde(skip)]
    pub(crate) meta: RecordMeta,
}

impl LinkRecord {
    /// Returns true if the link starts or ends at `node`.
    pub fn touches(&self, node: &EntityId) -> bool {
        self.source == *node || self.target == *node
    }
}

/// Immutable view of the replica at one version.
///
/// Readers hold an `Arc<GraphSnapshot>`; the merger copies on write, so a
/// held snapshot never changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphSnapshot {
    pub(crate) version: u64,
    pub(crate) nodes: BTreeMap<EntityId, NodeRecord>,
    pub(crate) links: BTreeMap<EntityId, LinkRecord>,
    #[serde(skip)]
    pub(crate) node_tombstones: BTreeMap<EntityId, WriteClock>,
    #[serde(skip)]
    pub(crate) link_tombstones: BTreeMap<EntityId, WriteClock>,
}

impl GraphSnapshot {
    /// Creates an empty snapshot at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot version; increases by one per applied batch.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Looks up a node.
    pub fn node(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    /// Looks up a link.
    pub fn link(&self, id: &str) -> Option<&LinkRecord> {
        self.links.get(id)
    }

    /// Iterates nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    /// Iterates links in id order.
    pub fn links(&self) -> impl Iterator<Item = &LinkRecord> {
        self.links.values()
    }

    /// Iterates links that start or end at `node`.
    pub fn links_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a LinkRecord> + 'a {
        self.links
            .values()
            .filter(move |link| link.source.as_str() == node || link.target.as_str() == node)
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of links.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Returns true if the snapshot holds no nodes and no links.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(id: &str, source: &str, target: &str) -> LinkRecord {
        LinkRecord {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            attributes: Attributes::new(),
            last_applied: SeqStamp::new(ConnectionId::new(1), 1),
            meta: RecordMeta::default(),
        }
    }

    #[test]
    fn empty_snapshot() {
        let snapshot = GraphSnapshot::new();
        assert_eq!(snapshot.version(), 0);
        assert!(snapshot.is_empty());
        assert!(snapshot.node("n1").is_none());
    }

    #[test]
    fn links_of_node() {
        let mut snapshot = GraphSnapshot::new();
        for l in [link("ab", "a", "b"), link("bc", "b", "c"), link("cd", "c", "d")] {
            snapshot.links.insert(l.id.clone(), l);
        }
        let ids: Vec<_> = snapshot.links_of("b").map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["ab", "bc"]);
        assert!(snapshot.link("ab").unwrap().touches(&EntityId::from("a")));
    }

    #[test]
    fn seen_tracks_highest_sequence() {
        let mut meta = RecordMeta::default();
        let conn = ConnectionId::new(2);
        meta.mark_seen(conn, 5);
        meta.mark_seen(conn, 3);
        assert!(meta.has_seen(conn, 5));
        assert!(!meta.has_seen(conn, 6));
        assert!(!meta.has_seen(ConnectionId::new(1), 1));
    }
}
