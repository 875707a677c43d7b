//! Typed protocol messages.

use crate::frame::FrameKind;
use crate::ids::{ConnectionId, EntityId};
use crate::operation::DeltaOp;
use crate::value::Attributes;
use serde::{Deserialize, Serialize};

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Server → client graph change.
    Delta(DeltaOp),
    /// Client → server graph change.
    Submit(DeltaOp),
    /// Heartbeat request.
    Ping(Heartbeat),
    /// Heartbeat reply, echoing the request.
    Pong(Heartbeat),
    /// Client asks for a full snapshot.
    ResyncRequest(ResyncRequest),
    /// Server answers with a full snapshot.
    ResyncResponse(ResyncSnapshot),
}

impl Message {
    /// Returns the frame kind carrying this message.
    pub fn kind(&self) -> FrameKind {
        match self {
            Message::Delta(_) => FrameKind::Delta,
            Message::Submit(_) => FrameKind::Submit,
            Message::Ping(_) => FrameKind::Ping,
            Message::Pong(_) => FrameKind::Pong,
            Message::ResyncRequest(_) => FrameKind::ResyncRequest,
            Message::ResyncResponse(_) => FrameKind::ResyncResponse,
        }
    }

    /// Returns the connection this message belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Message::Delta(op) | Message::Submit(op) => op.connection_id,
            Message::Ping(hb) | Message::Pong(hb) => hb.connection_id,
            Message::ResyncRequest(req) => req.connection_id,
            Message::ResyncResponse(snap) => snap.connection_id,
        }
    }

    /// Returns the envelope sequence number.
    ///
    /// Ops use their own sequence, heartbeats their nonce, resync messages
    /// the sequence watermark they refer to.
    pub fn sequence(&self) -> u64 {
        match self {
            Message::Delta(op) | Message::Submit(op) => op.sequence,
            Message::Ping(hb) | Message::Pong(hb) => hb.nonce,
            Message::ResyncRequest(req) => req.last_delivered,
            Message::ResyncResponse(snap) => snap.watermark,
        }
    }

    /// Returns the envelope timestamp in milliseconds.
    pub fn timestamp(&self) -> u64 {
        match self {
            Message::Delta(op) | Message::Submit(op) => op.timestamp,
            Message::Ping(hb) | Message::Pong(hb) => hb.sent_at,
            Message::ResyncRequest(_) | Message::ResyncResponse(_) => 0,
        }
    }
}

/// Heartbeat payload shared by ping and pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Connection being checked.
    pub connection_id: ConnectionId,
    /// Probe nonce, echoed by the pong.
    pub nonce: u64,
    /// Sender clock in milliseconds.
    pub sent_at: u64,
}

impl Heartbeat {
    /// Creates a heartbeat payload.
    pub fn new(connection_id: ConnectionId, nonce: u64, sent_at: u64) -> Self {
        Self {
            connection_id,
            nonce,
            sent_at,
        }
    }
}

/// Request for a full snapshot after the incremental stream desynced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncRequest {
    /// Connection whose stream desynced.
    pub connection_id: ConnectionId,
    /// Highest sequence delivered in order on that connection.
    pub last_delivered: u64,
}

/// Full node state inside a resync snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Node id.
    pub id: EntityId,
    /// Node attributes.
    #[serde(default)]
    pub attributes: Attributes,
}

/// Full link state inside a resync snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkState {
    /// Link id.
    pub id: EntityId,
    /// Source node id.
    pub source: EntityId,
    /// Target node id.
    pub target: EntityId,
    /// Link attributes.
    #[serde(default)]
    pub attributes: Attributes,
}

/// Full graph state as of a sequence watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResyncSnapshot {
    /// Connection the snapshot was produced for.
    pub connection_id: ConnectionId,
    /// Highest sequence already reflected in this snapshot.
    pub watermark: u64,
    /// All nodes.
    #[serde(default)]
    pub nodes: Vec<NodeState>,
    /// All links.
    #[serde(default)]
    pub links: Vec<LinkState>,
}
