//! Delta operations.

use crate::ids::{ConnectionId, EntityId, SeqStamp};
use crate::value::Attributes;
use serde::{Deserialize, Serialize};

/// Sequence number of the first op on a freshly opened link.
///
/// Every link numbers its ops from here; a reconnect starts over.
pub const FIRST_SEQUENCE: u64 = 1;

/// Whether an operation targets a node or a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A graph node.
    Node,
    /// A graph link (edge).
    Link,
}

/// Kind of a delta operation, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Node was created.
    AddNode,
    /// Node attributes changed.
    UpdateNode,
    /// Node was removed.
    RemoveNode,
    /// Link was created.
    AddLink,
    /// Link attributes changed.
    UpdateLink,
    /// Link was removed.
    RemoveLink,
}

/// Payload of a delta operation.
///
/// This is the only shape in which graph changes travel past the ingress
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaBody {
    /// Create a node (merges into an existing node with the same id).
    AddNode {
        /// Node id.
        id: EntityId,
        /// Initial attributes.
        #[serde(default)]
        attributes: Attributes,
    },
    /// Change node attributes.
    UpdateNode {
        /// Node id.
        id: EntityId,
        /// Changed attributes; `Null` removes a key.
        changes: Attributes,
    },
    /// Remove a node and every link touching it.
    RemoveNode {
        /// Node id.
        id: EntityId,
    },
    /// Create a link (merges into an existing link with the same id).
    AddLink {
        /// Link id.
        id: EntityId,
        /// Source node id.
        source: EntityId,
        /// Target node id.
        target: EntityId,
        /// Initial attributes.
        #[serde(default)]
        attributes: Attributes,
    },
    /// Change link attributes.
    UpdateLink {
        /// Link id.
        id: EntityId,
        /// Changed attributes; `Null` removes a key.
        changes: Attributes,
    },
    /// Remove a link.
    RemoveLink {
        /// Link id.
        id: EntityId,
    },
}

impl DeltaBody {
    /// Creates an `AddNode` body.
    pub fn add_node(id: impl Into<EntityId>, attributes: Attributes) -> Self {
        DeltaBody::AddNode {
            id: id.into(),
            attributes,
        }
    }

    /// Creates an `UpdateNode` body.
    pub fn update_node(id: impl Into<EntityId>, changes: Attributes) -> Self {
        DeltaBody::UpdateNode {
            id: id.into(),
            changes,
        }
    }

    /// Creates a `RemoveNode` body.
    pub fn remove_node(id: impl Into<EntityId>) -> Self {
        DeltaBody::RemoveNode { id: id.into() }
    }

    /// Creates an `AddLink` body.
    pub fn add_link(
        id: impl Into<EntityId>,
        source: impl Into<EntityId>,
        target: impl Into<EntityId>,
        attributes: Attributes,
    ) -> Self {
        DeltaBody::AddLink {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            attributes,
        }
    }

    /// Creates an `UpdateLink` body.
    pub fn update_link(id: impl Into<EntityId>, changes: Attributes) -> Self {
        DeltaBody::UpdateLink {
            id: id.into(),
            changes,
        }
    }

    /// Creates a `RemoveLink` body.
    pub fn remove_link(id: impl Into<EntityId>) -> Self {
        DeltaBody::RemoveLink { id: id.into() }
    }

    /// Returns the operation kind.
    pub fn kind(&self) -> OpKind {
        match self {
            DeltaBody::AddNode { .. } => OpKind::AddNode,
            DeltaBody::UpdateNode { .. } => OpKind::UpdateNode,
            DeltaBody::RemoveNode { .. } => OpKind::RemoveNode,
            DeltaBody::AddLink { .. } => OpKind::AddLink,
            DeltaBody::UpdateLink { .. } => OpKind::UpdateLink,
            DeltaBody::RemoveLink { .. } => OpKind::RemoveLink,
        }
    }

    /// Returns the id of the targeted entity.
    pub fn entity_id(&self) -> &EntityId {
        match self {
            DeltaBody::AddNode { id, .. }
            | DeltaBody::UpdateNode { id, .. }
            | DeltaBody::RemoveNode { id }
            | DeltaBody::AddLink { id, .. }
            | DeltaBody::UpdateLink { id, .. }
            | DeltaBody::RemoveLink { id } => id,
        }
    }

    /// Returns whether a node or a link is targeted.
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            DeltaBody::AddNode { .. } | DeltaBody::UpdateNode { .. } | DeltaBody::RemoveNode { .. } => {
                EntityKind::Node
            }
            _ => EntityKind::Link,
        }
    }
}

/// A single incremental change to the graph, as delivered by a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaOp {
    /// Connection the op arrived on (or `ConnectionId::LOCAL`).
    pub connection_id: ConnectionId,
    /// Per-connection sequence number; never reused.
    pub sequence: u64,
    /// Writer timestamp in milliseconds.
    pub timestamp: u64,
    /// The change itself.
    pub body: DeltaBody,
}

impl DeltaOp {
    /// Creates a new operation.
    pub fn new(connection_id: ConnectionId, sequence: u64, timestamp: u64, body: DeltaBody) -> Self {
        Self {
            connection_id,
            sequence,
            timestamp,
            body,
        }
    }

    /// Returns the `(connection, sequence)` stamp of this op.
    pub fn stamp(&self) -> SeqStamp {
        SeqStamp::new(self.connection_id, self.sequence)
    }

    /// Returns the operation kind.
    pub fn kind(&self) -> OpKind {
        self.body.kind()
    }
}
