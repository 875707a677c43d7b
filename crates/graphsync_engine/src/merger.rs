//! Applies ordered delta ops to the graph replica.
//!
//! [`DeltaMerger`] is the only writer of [`GraphSnapshot`]. Each batch is
//! applied to a private copy (`Arc::make_mut`) and becomes visible as one
//! version bump, so readers never observe half a batch.
//!
//! ## Merge rules
//!
//! - An op whose `(connection, sequence)` a record has already seen is a
//!   no-op, which makes every op idempotent.
//! - Attributes merge field by field. Each field remembers the clock of the
//!   write that last set it.
//! - Writes from the same connection are causally ordered and simply apply.
//!   Local writes are made against the current replica, so they causally
//!   follow everything in it and apply too.
//! - A remote write over a field last set by a different writer, with a
//!   different value, is a conflict: the greater `(timestamp, sequence)`
//!   wins, ties go to the higher-priority connection. Each one is counted.
//! - Removal leaves a tombstone clock so an older concurrent add cannot
//!   resurrect the entity. Removing a node removes its links.
//! - Tombstones expire once the newest applied timestamp is more than
//!   `tombstone_ttl` past them, and are capped at `max_tombstones`.

use crate::config::MergeConfig;
use crate::snapshot::{GraphSnapshot, LinkRecord, NodeRecord, RecordMeta, WriteClock};
use crate::stats::StatsAggregator;
use graphsync_protocol::{
    Attributes, ConnectionId, DeltaBody, DeltaOp, EntityId, ResyncSnapshot, SeqStamp,
};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// How an entity changed within one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Entity did not exist before the batch.
    Added,
    /// Entity existed and changed.
    Updated,
    /// Entity existed and is gone.
    Removed,
}

/// Entities touched by one published version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    /// Net change per node.
    pub nodes: BTreeMap<EntityId, ChangeKind>,
    /// Net change per link.
    pub links: BTreeMap<EntityId, ChangeKind>,
    /// The whole graph was replaced by a resync snapshot.
    pub replaced: bool,
}

impl ChangeSet {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.links.is_empty() && !self.replaced
    }

    /// Node ids with the given change.
    pub fn nodes_with(&self, kind: ChangeKind) -> impl Iterator<Item = &EntityId> {
        self.nodes
            .iter()
            .filter(move |(_, k)| **k == kind)
            .map(|(id, _)| id)
    }

    /// Link ids with the given change.
    pub fn links_with(&self, kind: ChangeKind) -> impl Iterator<Item = &EntityId> {
        self.links
            .iter()
            .filter(move |(_, k)| **k == kind)
            .map(|(id, _)| id)
    }

    fn note(map: &mut BTreeMap<EntityId, ChangeKind>, id: &EntityId, change: ChangeKind) {
        use ChangeKind::*;
        let next = match (map.get(id).copied(), change) {
            (None, change) => Some(change),
            (Some(Added), Removed) => None,
            (Some(Added), _) => Some(Added),
            (Some(Removed), Added) => Some(Updated),
            (Some(_), change) => Some(change),
        };
        match next {
            Some(kind) => {
                map.insert(id.clone(), kind);
            }
            None => {
                map.remove(id);
            }
        }
    }
}

/// Result of applying one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Ops that changed the replica.
    pub applied: usize,
    /// Ops discarded as duplicates, stale, lost conflicts or no-ops.
    pub skipped: usize,
    /// Conflicts resolved while applying.
    pub conflicts: usize,
    /// New version if the batch was published, `None` for a no-op batch.
    pub version: Option<u64>,
    /// What changed.
    pub changes: ChangeSet,
}

#[derive(Debug, Default)]
struct OpEffect {
    applied: bool,
    conflicts: usize,
}

/// The only mutator of [`GraphSnapshot`].
pub struct DeltaMerger {
    snapshot: Arc<GraphSnapshot>,
    config: MergeConfig,
    stats: Arc<StatsAggregator>,
    local_sequence: u64,
    /// Newest op timestamp applied; the tombstone expiry clock.
    high_water: u64,
}

impl DeltaMerger {
    /// Creates a merger over an empty snapshot.
    pub fn new(config: MergeConfig, stats: Arc<StatsAggregator>) -> Self {
        Self {
            snapshot: Arc::new(GraphSnapshot::new()),
            config,
            stats,
            local_sequence: 0,
            high_water: 0,
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Current version.
    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    /// Applies `ops` in order as one atomic batch.
    pub fn apply_batch(&mut self, ops: &[DeltaOp]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if ops.is_empty() {
            return outcome;
        }

        // Copies only if a reader still holds the current version
        let mut snapshot = std::mem::take(&mut self.snapshot);
        let working = Arc::make_mut(&mut snapshot);
        for op in ops {
            let effect = self.apply_op(working, op, &mut outcome.changes);
            outcome.conflicts += effect.conflicts;
            if effect.applied {
                outcome.applied += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        if outcome.applied > 0 {
            working.version += 1;
            outcome.version = Some(working.version);
            if let Some(newest) = ops.iter().map(|op| op.timestamp).max() {
                self.high_water = self.high_water.max(newest);
            }
            self.prune_tombstones(working);
        }
        self.snapshot = snapshot;

        if let Some(version) = outcome.version {
            debug!(
                version,
                applied = outcome.applied,
                skipped = outcome.skipped,
                conflicts = outcome.conflicts,
                "batch applied"
            );
        }

        self.stats.record_conflicts(outcome.conflicts as u64);
        self.stats.record_batch(
            outcome.applied as u64,
            outcome.skipped as u64,
            outcome.version.is_some(),
        );
        outcome
    }

    /// Stamps a client-originated write and applies it optimistically.
    ///
    /// Returns the stamped op, ready to send or queue.
    pub fn apply_local(&mut self, body: DeltaBody, timestamp: u64) -> (DeltaOp, BatchOutcome) {
        self.local_sequence += 1;
        let op = DeltaOp::new(ConnectionId::LOCAL, self.local_sequence, timestamp, body);
        let outcome = self.apply_batch(std::slice::from_ref(&op));
        (op, outcome)
    }

    /// Replaces the replica with a resync snapshot, as one version bump.
    ///
    /// `unacknowledged` local writes are replayed on top so optimistic
    /// state survives the resync.
    pub fn replace_snapshot(
        &mut self,
        resync: &ResyncSnapshot,
        unacknowledged: &[DeltaOp],
    ) -> BatchOutcome {
        let connection = resync.connection_id;
        let stamp = SeqStamp::new(connection, resync.watermark);
        let clock = WriteClock::new(0, resync.watermark, connection);

        let mut next = GraphSnapshot {
            version: self.snapshot.version + 1,
            ..GraphSnapshot::default()
        };
        for node in &resync.nodes {
            let (attributes, meta) = created_state(&node.attributes, clock);
            next.nodes.insert(
                node.id.clone(),
                NodeRecord {
                    id: node.id.clone(),
                    attributes,
                    last_applied: stamp,
                    meta,
                },
            );
        }
        for link in &resync.links {
            let (attributes, meta) = created_state(&link.attributes, clock);
            next.links.insert(
                link.id.clone(),
                LinkRecord {
                    id: link.id.clone(),
                    source: link.source.clone(),
                    target: link.target.clone(),
                    attributes,
                    last_applied: stamp,
                    meta,
                },
            );
        }

        let mut changes = ChangeSet {
            replaced: true,
            ..ChangeSet::default()
        };
        let mut replayed = 0usize;
        for op in unacknowledged {
            if self.apply_op(&mut next, op, &mut changes).applied {
                replayed += 1;
            }
        }

        let outcome = BatchOutcome {
            applied: next.nodes.len() + next.links.len(),
            skipped: 0,
            conflicts: 0,
            version: Some(next.version),
            changes,
        };
        debug!(
            version = next.version,
            %connection,
            watermark = resync.watermark,
            replayed,
            "snapshot replaced"
        );
        self.snapshot = Arc::new(next);
        self.stats.record_batch(0, 0, true);
        outcome
    }

    /// Forgets the per-connection sequence bookkeeping of `connection`.
    ///
    /// Called when the connection's link is replaced: the new link numbers
    /// its ops from the start again, so sequences seen on the old link must
    /// not mask them. Tombstones keep their timestamps but lose their
    /// sequence, so any create from the new link counts as later. The
    /// visible graph and its version are unchanged.
    pub fn forget_connection(&mut self, connection: ConnectionId) {
        if connection.is_local() {
            return;
        }
        let graph = Arc::make_mut(&mut self.snapshot);
        let mut forgotten = 0usize;
        for meta in graph
            .nodes
            .values_mut()
            .map(|n| &mut n.meta)
            .chain(graph.links.values_mut().map(|l| &mut l.meta))
        {
            if meta.seen.remove(&connection).is_some() {
                forgotten += 1;
            }
        }
        for tomb in graph
            .node_tombstones
            .values_mut()
            .chain(graph.link_tombstones.values_mut())
            .filter(|tomb| tomb.connection == connection)
        {
            tomb.sequence = 0;
            forgotten += 1;
        }
        debug!(%connection, forgotten, "connection sequence state forgotten");
    }

    /// Number of node and link tombstones held.
    pub fn tombstone_count(&self) -> usize {
        self.snapshot.node_tombstones.len() + self.snapshot.link_tombstones.len()
    }

    fn prune_tombstones(&self, graph: &mut GraphSnapshot) {
        let ttl = self.config.tombstone_ttl.as_millis() as u64;
        let horizon = self.high_water.saturating_sub(ttl);
        let max = self.config.max_tombstones;
        let pruned = prune(&mut graph.node_tombstones, horizon, max)
            + prune(&mut graph.link_tombstones, horizon, max);
        if pruned > 0 {
            trace!(pruned, horizon, "tombstones pruned");
        }
    }

    fn apply_op(&self, graph: &mut GraphSnapshot, op: &DeltaOp, changes: &mut ChangeSet) -> OpEffect {
        let clock = WriteClock::new(op.timestamp, op.sequence, op.connection_id);
        let effect = match &op.body {
            DeltaBody::AddNode { id, attributes } => {
                self.add_node(graph, id, attributes, op, clock, changes)
            }
            DeltaBody::UpdateNode { id, changes: attrs } => match graph.nodes.get_mut(id) {
                Some(node) => {
                    let effect = self.update_record(
                        &mut node.attributes,
                        &mut node.last_applied,
                        &mut node.meta,
                        attrs,
                        op,
                        clock,
                    );
                    if effect.applied {
                        ChangeSet::note(&mut changes.nodes, id, ChangeKind::Updated);
                    }
                    effect
                }
                None => OpEffect::default(),
            },
            DeltaBody::RemoveNode { id } => self.remove_node(graph, id, op, clock, changes),
            DeltaBody::AddLink {
                id,
                source,
                target,
                attributes,
            } => self.add_link(graph, id, source, target, attributes, op, clock, changes),
            DeltaBody::UpdateLink { id, changes: attrs } => match graph.links.get_mut(id) {
                Some(link) => {
                    let effect = self.update_record(
                        &mut link.attributes,
                        &mut link.last_applied,
                        &mut link.meta,
                        attrs,
                        op,
                        clock,
                    );
                    if effect.applied {
                        ChangeSet::note(&mut changes.links, id, ChangeKind::Updated);
                    }
                    effect
                }
                None => OpEffect::default(),
            },
            DeltaBody::RemoveLink { id } => self.remove_link(graph, id, op, clock, changes),
        };

        if !effect.applied {
            trace!(
                connection = %op.connection_id,
                sequence = op.sequence,
                kind = ?op.kind(),
                "op skipped"
            );
        }
        effect
    }

    fn add_node(
        &self,
        graph: &mut GraphSnapshot,
        id: &EntityId,
        attributes: &Attributes,
        op: &DeltaOp,
        clock: WriteClock,
        changes: &mut ChangeSet,
    ) -> OpEffect {
        if let Some(node) = graph.nodes.get_mut(id) {
            let effect = self.update_record(
                &mut node.attributes,
                &mut node.last_applied,
                &mut node.meta,
                attributes,
                op,
                clock,
            );
            if effect.applied {
                ChangeSet::note(&mut changes.nodes, id, ChangeKind::Updated);
            }
            return effect;
        }

        let (admit, conflicts) = self.admits_creation(graph.node_tombstones.get(id), clock);
        if !admit {
            return OpEffect {
                applied: false,
                conflicts,
            };
        }

        graph.node_tombstones.remove(id);
        let (attributes, meta) = created_state(attributes, clock);
        graph.nodes.insert(
            id.clone(),
            NodeRecord {
                id: id.clone(),
                attributes,
                last_applied: op.stamp(),
                meta,
            },
        );
        ChangeSet::note(&mut changes.nodes, id, ChangeKind::Added);
        OpEffect {
            applied: true,
            conflicts,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_link(
        &self,
        graph: &mut GraphSnapshot,
        id: &EntityId,
        source: &EntityId,
        target: &EntityId,
        attributes: &Attributes,
        op: &DeltaOp,
        clock: WriteClock,
        changes: &mut ChangeSet,
    ) -> OpEffect {
        if let Some(link) = graph.links.get_mut(id) {
            let effect = self.update_record(
                &mut link.attributes,
                &mut link.last_applied,
                &mut link.meta,
                attributes,
                op,
                clock,
            );
            if effect.applied {
                ChangeSet::note(&mut changes.links, id, ChangeKind::Updated);
            }
            return effect;
        }

        let (admit, conflicts) = self.admits_creation(graph.link_tombstones.get(id), clock);
        if !admit {
            return OpEffect {
                applied: false,
                conflicts,
            };
        }

        graph.link_tombstones.remove(id);
        let (attributes, meta) = created_state(attributes, clock);
        graph.links.insert(
            id.clone(),
            LinkRecord {
                id: id.clone(),
                source: source.clone(),
                target: target.clone(),
                attributes,
                last_applied: op.stamp(),
                meta,
            },
        );
        ChangeSet::note(&mut changes.links, id, ChangeKind::Added);
        OpEffect {
            applied: true,
            conflicts,
        }
    }

    fn remove_node(
        &self,
        graph: &mut GraphSnapshot,
        id: &EntityId,
        op: &DeltaOp,
        clock: WriteClock,
        changes: &mut ChangeSet,
    ) -> OpEffect {
        let Some(node) = graph.nodes.get(id) else {
            return OpEffect::default();
        };
        let (admit, conflicts) = self.admits_removal(&node.meta, op, clock);
        if !admit {
            return OpEffect {
                applied: false,
                conflicts,
            };
        }

        graph.nodes.remove(id);
        graph.node_tombstones.insert(id.clone(), clock);
        ChangeSet::note(&mut changes.nodes, id, ChangeKind::Removed);

        let incident: Vec<EntityId> = graph
            .links
            .values()
            .filter(|link| link.touches(id))
            .map(|link| link.id.clone())
            .collect();
        for link_id in incident {
            graph.links.remove(&link_id);
            graph.link_tombstones.insert(link_id.clone(), clock);
            ChangeSet::note(&mut changes.links, &link_id, ChangeKind::Removed);
        }

        OpEffect {
            applied: true,
            conflicts,
        }
    }

    fn remove_link(
        &self,
        graph: &mut GraphSnapshot,
        id: &EntityId,
        op: &DeltaOp,
        clock: WriteClock,
        changes: &mut ChangeSet,
    ) -> OpEffect {
        let Some(link) = graph.links.get(id) else {
            return OpEffect::default();
        };
        let (admit, conflicts) = self.admits_removal(&link.meta, op, clock);
        if !admit {
            return OpEffect {
                applied: false,
                conflicts,
            };
        }

        graph.links.remove(id);
        graph.link_tombstones.insert(id.clone(), clock);
        ChangeSet::note(&mut changes.links, id, ChangeKind::Removed);
        OpEffect {
            applied: true,
            conflicts,
        }
    }

    /// Merges attribute changes into an existing record.
    fn update_record(
        &self,
        attributes: &mut Attributes,
        last_applied: &mut SeqStamp,
        meta: &mut RecordMeta,
        changes: &Attributes,
        op: &DeltaOp,
        clock: WriteClock,
    ) -> OpEffect {
        if meta.has_seen(op.connection_id, op.sequence) {
            return OpEffect::default();
        }
        meta.mark_seen(op.connection_id, op.sequence);

        let mut effect = OpEffect::default();
        let mut accepted = changes.is_empty();
        for (key, value) in changes {
            let divergent = match attributes.get(key) {
                Some(current) => current != value,
                None => !value.is_null(),
            };

            if let Some(existing) = meta.clocks.get(key) {
                if !self.causally_follows(existing, clock) {
                    if divergent {
                        effect.conflicts += 1;
                    }
                    if !self.wins(clock, *existing) {
                        continue;
                    }
                }
            }

            accepted = true;
            meta.clocks.insert(key.clone(), clock);
            if divergent {
                if value.is_null() {
                    attributes.remove(key);
                } else {
                    attributes.insert(key.clone(), value.clone());
                }
            }
        }

        if accepted {
            *last_applied = op.stamp();
            effect.applied = true;
        }
        effect
    }

    /// Decides whether a create may proceed past a tombstone.
    fn admits_creation(&self, tombstone: Option<&WriteClock>, clock: WriteClock) -> (bool, usize) {
        match tombstone {
            None => (true, 0),
            Some(tomb) if tomb.connection == clock.connection => {
                // Same writer: only a later create counts
                (clock.sequence > tomb.sequence, 0)
            }
            Some(_) if clock.connection.is_local() => (true, 0),
            Some(tomb) => (self.wins(clock, *tomb), 1),
        }
    }

    /// Decides whether a remove may proceed over concurrent newer writes.
    fn admits_removal(&self, meta: &RecordMeta, op: &DeltaOp, clock: WriteClock) -> (bool, usize) {
        if meta.has_seen(op.connection_id, op.sequence) {
            return (false, 0);
        }
        if clock.connection.is_local() {
            return (true, 0);
        }

        let newer_concurrent = meta
            .clocks
            .values()
            .chain(meta.created.iter())
            .filter(|c| c.connection != clock.connection)
            .any(|c| self.wins(*c, clock));
        if newer_concurrent {
            (false, 1)
        } else {
            (true, 0)
        }
    }

    /// Whether a write at `clock` is known to happen after `existing`.
    fn causally_follows(&self, existing: &WriteClock, clock: WriteClock) -> bool {
        existing.connection == clock.connection || clock.connection.is_local()
    }

    /// Total order used for last-writer-wins.
    pub fn compare(&self, a: WriteClock, b: WriteClock) -> Ordering {
        (a.timestamp, a.sequence)
            .cmp(&(b.timestamp, b.sequence))
            .then_with(|| self.config.rank(b.connection).cmp(&self.config.rank(a.connection)))
    }

    fn wins(&self, incoming: WriteClock, current: WriteClock) -> bool {
        self.compare(incoming, current) == Ordering::Greater
    }
}

/// Drops tombstones older than `horizon`, then the oldest beyond `max`.
fn prune(tombstones: &mut BTreeMap<EntityId, WriteClock>, horizon: u64, max: usize) -> usize {
    let before = tombstones.len();
    tombstones.retain(|_, clock| clock.timestamp >= horizon);
    if tombstones.len() > max {
        let mut by_age: Vec<(WriteClock, EntityId)> = tombstones
            .iter()
            .map(|(id, clock)| (*clock, id.clone()))
            .collect();
        by_age.sort_by_key(|(clock, _)| (clock.timestamp, clock.sequence));
        let excess = by_age.len() - max;
        for (_, id) in by_age.into_iter().take(excess) {
            tombstones.remove(&id);
        }
    }
    before - tombstones.len()
}

fn without_nulls(attributes: &Attributes) -> Attributes {
    attributes
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn created_state(attributes: &Attributes, clock: WriteClock) -> (Attributes, RecordMeta) {
    let attributes = without_nulls(attributes);
    let mut meta = RecordMeta {
        clocks: attributes.keys().map(|k| (k.clone(), clock)).collect(),
        created: Some(clock),
        seen: BTreeMap::new(),
    };
    meta.mark_seen(clock.connection, clock.sequence);
    (attributes, meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphsync_protocol::{AttrValue, LinkState, NodeState};
    use std::time::Duration;

    const A: ConnectionId = ConnectionId::new(1);
    const B: ConnectionId = ConnectionId::new(2);

    fn attrs(pairs: &[(&str, AttrValue)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn op(conn: ConnectionId, seq: u64, ts: u64, body: DeltaBody) -> DeltaOp {
        DeltaOp::new(conn, seq, ts, body)
    }

    fn merger() -> (DeltaMerger, Arc<StatsAggregator>) {
        let stats = Arc::new(StatsAggregator::new());
        (DeltaMerger::new(MergeConfig::default(), Arc::clone(&stats)), stats)
    }

    fn seeded() -> (DeltaMerger, Arc<StatsAggregator>) {
        let (mut m, stats) = merger();
        m.apply_batch(&[
            op(A, 1, 10, DeltaBody::add_node("n1", attrs(&[("label", "one".into())]))),
            op(A, 2, 11, DeltaBody::add_node("n2", attrs(&[("label", "two".into())]))),
            op(A, 3, 12, DeltaBody::add_link("l1", "n1", "n2", attrs(&[("weight", 1.into())]))),
        ]);
        (m, stats)
    }

    fn weight(m: &DeltaMerger) -> Option<i64> {
        m.snapshot()
            .link("l1")
            .and_then(|l| l.attributes.get("weight"))
            .and_then(AttrValue::as_i64)
    }

    #[test]
    fn batch_bumps_version_once() {
        let (m, stats) = seeded();
        let snap = m.snapshot();
        assert_eq!(snap.version(), 1);
        assert_eq!(snap.node_count(), 2);
        assert_eq!(snap.link_count(), 1);
        assert_eq!(snap.node("n1").unwrap().last_applied, SeqStamp::new(A, 1));
        assert_eq!(stats.snapshot().batches_applied, 1);
        assert_eq!(stats.snapshot().ops_applied, 3);
    }

    #[test]
    fn every_op_kind_is_idempotent() {
        let bodies = vec![
            DeltaBody::add_node("n3", attrs(&[("label", "three".into())])),
            DeltaBody::update_node("n1", attrs(&[("label", "uno".into())])),
            DeltaBody::remove_node("n2"),
            DeltaBody::add_link("l2", "n1", "n3", Attributes::new()),
            DeltaBody::update_link("l1", attrs(&[("weight", 9.into())])),
            DeltaBody::remove_link("l1"),
        ];
        for (i, body) in bodies.into_iter().enumerate() {
            let (mut once, _) = seeded();
            let (mut twice, _) = seeded();
            let delta = op(A, 10 + i as u64, 100, body);

            once.apply_batch(std::slice::from_ref(&delta));
            twice.apply_batch(std::slice::from_ref(&delta));
            let outcome = twice.apply_batch(std::slice::from_ref(&delta));

            assert_eq!(outcome.version, None, "replay of op {i} bumped the version");
            assert_eq!(*once.snapshot(), *twice.snapshot(), "op {i} not idempotent");
        }
    }

    #[test]
    fn stale_sequence_is_skipped() {
        let (mut m, stats) = seeded();
        m.apply_batch(&[op(A, 5, 20, DeltaBody::update_node("n1", attrs(&[("label", "new".into())])))]);
        let outcome = m.apply_batch(&[op(
            A,
            4,
            30,
            DeltaBody::update_node("n1", attrs(&[("label", "old".into())])),
        )]);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(
            m.snapshot().node("n1").unwrap().attributes["label"],
            AttrValue::from("new")
        );
        assert_eq!(stats.snapshot().ops_skipped, 1);
    }

    #[test]
    fn local_write_then_newer_remote_write_conflicts() {
        let (mut m, stats) = seeded();
        let (local, outcome) =
            m.apply_local(DeltaBody::update_link("l1", attrs(&[("weight", 5.into())])), 100);
        assert_eq!(local.connection_id, ConnectionId::LOCAL);
        assert_eq!(local.sequence, 1);
        assert_eq!(outcome.conflicts, 0);
        assert_eq!(weight(&m), Some(5));

        let outcome = m.apply_batch(&[op(
            A,
            4,
            105,
            DeltaBody::update_link("l1", attrs(&[("weight", 7.into())])),
        )]);
        assert_eq!(outcome.conflicts, 1);
        assert_eq!(weight(&m), Some(7));
        assert_eq!(stats.snapshot().conflicts_resolved, 1);
    }

    #[test]
    fn older_remote_write_loses_to_local_write() {
        let (mut m, _) = seeded();
        m.apply_local(DeltaBody::update_link("l1", attrs(&[("weight", 5.into())])), 200);
        let outcome = m.apply_batch(&[op(
            A,
            4,
            150,
            DeltaBody::update_link("l1", attrs(&[("weight", 7.into())])),
        )]);
        assert_eq!(outcome.conflicts, 1);
        assert_eq!(outcome.version, None);
        assert_eq!(weight(&m), Some(5));
    }

    #[test]
    fn conflict_resolution_ignores_arrival_order() {
        let first = op(A, 7, 100, DeltaBody::update_link("l1", attrs(&[("weight", 5.into())])));
        let second = op(B, 3, 105, DeltaBody::update_link("l1", attrs(&[("weight", 7.into())])));

        let (mut ab, _) = seeded();
        ab.apply_batch(&[first.clone()]);
        ab.apply_batch(&[second.clone()]);

        let (mut ba, _) = seeded();
        ba.apply_batch(&[second]);
        ba.apply_batch(&[first]);

        assert_eq!(weight(&ab), Some(7));
        assert_eq!(weight(&ba), Some(7));
    }

    #[test]
    fn ties_go_to_priority_order() {
        let stats = Arc::new(StatsAggregator::new());
        let config = MergeConfig::with_priority(vec![B, A]);
        let run = |order: [&DeltaOp; 2]| {
            let mut m = DeltaMerger::new(config.clone(), Arc::clone(&stats));
            m.apply_batch(&[op(A, 1, 1, DeltaBody::add_node("n", Attributes::new()))]);
            for o in order {
                m.apply_batch(std::slice::from_ref(o));
            }
            m.snapshot().node("n").unwrap().attributes["color"].clone()
        };

        let from_a = op(A, 9, 50, DeltaBody::update_node("n", attrs(&[("color", "red".into())])));
        let from_b = op(B, 9, 50, DeltaBody::update_node("n", attrs(&[("color", "blue".into())])));
        assert_eq!(run([&from_a, &from_b]), AttrValue::from("blue"));
        assert_eq!(run([&from_b, &from_a]), AttrValue::from("blue"));
    }

    #[test]
    fn same_value_from_other_writer_is_not_a_conflict() {
        let (mut m, _) = seeded();
        let outcome = m.apply_batch(&[op(
            B,
            1,
            500,
            DeltaBody::update_link("l1", attrs(&[("weight", 1.into())])),
        )]);
        assert_eq!(outcome.conflicts, 0);
        assert_eq!(outcome.applied, 1);
    }

    #[test]
    fn add_on_existing_merges() {
        let (mut m, _) = seeded();
        let outcome = m.apply_batch(&[op(
            A,
            4,
            20,
            DeltaBody::add_node("n1", attrs(&[("size", 3.into())])),
        )]);
        assert_eq!(outcome.changes.nodes[&EntityId::from("n1")], ChangeKind::Updated);
        let snap = m.snapshot();
        let node = snap.node("n1").unwrap();
        assert_eq!(node.attributes.len(), 2);
        assert_eq!(snap.node_count(), 2);
    }

    #[test]
    fn null_removes_attribute() {
        let (mut m, _) = seeded();
        m.apply_batch(&[op(A, 4, 20, DeltaBody::update_node("n1", attrs(&[("label", AttrValue::Null)])))]);
        assert!(m.snapshot().node("n1").unwrap().attributes.is_empty());
    }

    #[test]
    fn unknown_targets_are_noops() {
        let (mut m, _) = seeded();
        let outcome = m.apply_batch(&[
            op(A, 4, 20, DeltaBody::remove_node("ghost")),
            op(A, 5, 20, DeltaBody::remove_link("ghost")),
            op(A, 6, 20, DeltaBody::update_node("ghost", attrs(&[("x", 1.into())]))),
        ]);
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.skipped, 3);
        assert_eq!(outcome.version, None);
        assert_eq!(m.version(), 1);
    }

    #[test]
    fn remove_node_cascades_to_links() {
        let (mut m, _) = seeded();
        let outcome = m.apply_batch(&[op(A, 4, 20, DeltaBody::remove_node("n2"))]);
        let snap = m.snapshot();
        assert!(snap.node("n2").is_none());
        assert!(snap.link("l1").is_none());
        assert_eq!(outcome.changes.links[&EntityId::from("l1")], ChangeKind::Removed);
    }

    #[test]
    fn tombstone_blocks_older_concurrent_add() {
        let (mut m, stats) = seeded();
        m.apply_batch(&[op(A, 4, 200, DeltaBody::remove_node("n1"))]);

        let outcome = m.apply_batch(&[op(B, 1, 150, DeltaBody::add_node("n1", Attributes::new()))]);
        assert_eq!(outcome.applied, 0);
        assert!(m.snapshot().node("n1").is_none());
        assert_eq!(stats.snapshot().conflicts_resolved, 1);

        // A newer add from the same writer does come back
        m.apply_batch(&[op(A, 5, 210, DeltaBody::add_node("n1", Attributes::new()))]);
        assert!(m.snapshot().node("n1").is_some());
    }

    #[test]
    fn newer_concurrent_update_survives_older_remove() {
        let (mut m, _) = seeded();
        m.apply_batch(&[op(B, 1, 300, DeltaBody::update_node("n2", attrs(&[("label", "b".into())])))]);
        let outcome = m.apply_batch(&[op(A, 4, 250, DeltaBody::remove_node("n2"))]);
        assert_eq!(outcome.conflicts, 1);
        assert!(m.snapshot().node("n2").is_some());
    }

    #[test]
    fn held_snapshot_never_changes() {
        let (mut m, _) = seeded();
        let before = m.snapshot();
        m.apply_batch(&[op(A, 4, 20, DeltaBody::remove_node("n1"))]);
        assert_eq!(before.version(), 1);
        assert!(before.node("n1").is_some());
        assert_eq!(m.snapshot().version(), 2);
    }

    #[test]
    fn change_set_reports_net_effect() {
        let (mut m, _) = merger();
        let outcome = m.apply_batch(&[
            op(A, 1, 1, DeltaBody::add_node("tmp", Attributes::new())),
            op(A, 2, 1, DeltaBody::add_node("keep", Attributes::new())),
            op(A, 3, 1, DeltaBody::update_node("keep", attrs(&[("x", 1.into())]))),
            op(A, 4, 1, DeltaBody::remove_node("tmp")),
        ]);
        assert_eq!(outcome.changes.nodes.len(), 1);
        assert_eq!(
            outcome.changes.nodes_with(ChangeKind::Added).collect::<Vec<_>>(),
            vec![&EntityId::from("keep")]
        );
    }

    #[test]
    fn replace_snapshot_installs_resync() {
        let (mut m, _) = seeded();
        let resync = ResyncSnapshot {
            connection_id: A,
            watermark: 40,
            nodes: vec![NodeState {
                id: "x".into(),
                attributes: attrs(&[("label", "x".into())]),
            }],
            links: vec![LinkState {
                id: "lx".into(),
                source: "x".into(),
                target: "x".into(),
                attributes: Attributes::new(),
            }],
        };
        let outcome = m.replace_snapshot(&resync, &[]);
        assert_eq!(outcome.version, Some(2));
        assert!(outcome.changes.replaced);

        let snap = m.snapshot();
        assert!(snap.node("n1").is_none());
        assert_eq!(snap.node("x").unwrap().last_applied, SeqStamp::new(A, 40));
        assert_eq!(snap.link_count(), 1);

        // Ops reflected by the watermark are no-ops
        let outcome = m.apply_batch(&[op(A, 40, 1, DeltaBody::update_node("x", attrs(&[("label", "y".into())])))]);
        assert_eq!(outcome.version, None);
        let outcome = m.apply_batch(&[op(A, 41, 1, DeltaBody::update_node("x", attrs(&[("label", "y".into())])))]);
        assert_eq!(outcome.version, Some(3));
    }

    #[test]
    fn replace_snapshot_replays_unacknowledged_local_writes() {
        let (mut m, _) = merger();
        let (pending, _) = m.apply_local(DeltaBody::update_node("x", attrs(&[("label", "mine".into())])), 500);
        let resync = ResyncSnapshot {
            connection_id: A,
            watermark: 3,
            nodes: vec![NodeState {
                id: "x".into(),
                attributes: attrs(&[("label", "server".into()), ("size", 2.into())]),
            }],
            links: Vec::new(),
        };

        let outcome = m.replace_snapshot(&resync, std::slice::from_ref(&pending));
        assert_eq!(outcome.version, Some(1));

        let snap = m.snapshot();
        let node = snap.node("x").unwrap();
        assert_eq!(node.attributes["label"], AttrValue::from("mine"));
        assert_eq!(node.attributes["size"], AttrValue::from(2));
    }
    #[test]
    fn replaced_link_restarts_sequences() {
        let (mut m, stats) = seeded();
        m.apply_batch(&[op(A, 4, 20, DeltaBody::update_node("n1", attrs(&[("label", "A2".into())])))]);

        // Same connection, new link numbering from one
        m.forget_connection(A);
        assert_eq!(m.version(), 2);
        let outcome = m.apply_batch(&[op(
            A,
            1,
            30,
            DeltaBody::update_node("n1", attrs(&[("label", "B".into())])),
        )]);

        assert_eq!(outcome.applied, 1);
        assert_eq!(stats.snapshot().ops_skipped, 0);
        let label = m.snapshot().node("n1").and_then(|n| n.attributes.get("label").cloned());
        assert_eq!(label, Some(AttrValue::from("B")));
    }

    #[test]
    fn replaced_link_may_recreate_removed_entity() {
        let (mut m, _) = seeded();
        m.apply_batch(&[op(A, 4, 20, DeltaBody::remove_node("n2"))]);
        m.forget_connection(A);

        let outcome = m.apply_batch(&[op(A, 1, 30, DeltaBody::add_node("n2", Attributes::new()))]);
        assert_eq!(outcome.applied, 1);
        assert!(m.snapshot().node("n2").is_some());
    }

    #[test]
    fn expired_tombstones_are_pruned() {
        let stats = Arc::new(StatsAggregator::new());
        let config = MergeConfig::default().with_tombstone_ttl(Duration::from_millis(100));
        let mut m = DeltaMerger::new(config, stats);
        m.apply_batch(&[
            op(A, 1, 10, DeltaBody::add_node("n1", Attributes::new())),
            op(A, 2, 20, DeltaBody::remove_node("n1")),
        ]);
        assert_eq!(m.tombstone_count(), 1);

        m.apply_batch(&[op(A, 3, 110, DeltaBody::add_node("n2", Attributes::new()))]);
        assert_eq!(m.tombstone_count(), 1);

        m.apply_batch(&[op(A, 4, 121, DeltaBody::add_node("n3", Attributes::new()))]);
        assert_eq!(m.tombstone_count(), 0);
    }

    #[test]
    fn tombstones_are_capped_oldest_first() {
        let stats = Arc::new(StatsAggregator::new());
        let mut m = DeltaMerger::new(MergeConfig::default().with_max_tombstones(2), stats);
        let mut ops = Vec::new();
        for (i, id) in ["a", "b", "c"].into_iter().enumerate() {
            let seq = i as u64 * 2 + 1;
            ops.push(op(A, seq, seq, DeltaBody::add_node(id, Attributes::new())));
            ops.push(op(A, seq + 1, seq + 1, DeltaBody::remove_node(id)));
        }
        m.apply_batch(&ops);

        let snapshot = m.snapshot();
        assert_eq!(m.tombstone_count(), 2);
        assert!(!snapshot.node_tombstones.contains_key(&EntityId::from("a")));
        assert!(snapshot.node_tombstones.contains_key(&EntityId::from("c")));
    }
}
