//! Op, frame and attribute fixtures.
//!
//! Fixtures panic on codec failures: they only ever encode values the
//! protocol accepts.

use graphsync_protocol::{
    AttrValue, Attributes, ConnectionId, DeltaBody, DeltaOp, Frame, Message, NodeState,
};

/// Attributes with a single `label` text entry.
pub fn labelled(label: &str) -> Attributes {
    attrs([("label", AttrValue::from(label))])
}

/// Attributes with a single `weight` integer entry.
pub fn weighted(weight: i64) -> Attributes {
    attrs([("weight", AttrValue::from(weight))])
}

/// Builds attributes from key/value pairs.
pub fn attrs<'a, I>(pairs: I) -> Attributes
where
    I: IntoIterator<Item = (&'a str, AttrValue)>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Shorthand for [`DeltaOp::new`].
pub fn op(connection: u32, sequence: u64, timestamp: u64, body: DeltaBody) -> DeltaOp {
    DeltaOp::new(ConnectionId::new(connection), sequence, timestamp, body)
}

/// An `AddNode` op with no attributes, timestamped with its sequence.
pub fn node_op(connection: u32, sequence: u64, id: &str) -> DeltaOp {
    op(
        connection,
        sequence,
        sequence,
        DeltaBody::add_node(id, Attributes::new()),
    )
}

/// A node state with a label, as found in resync snapshots.
pub fn node_state(id: &str, label: &str) -> NodeState {
    NodeState {
        id: id.into(),
        attributes: labelled(label),
    }
}

/// Encodes a message as wire bytes.
pub fn frame_bytes(message: &Message, compressed: bool) -> Vec<u8> {
    Frame::from_message(message, compressed)
        .and_then(|frame| frame.to_bytes())
        .expect("fixture message must encode")
}

/// Encodes a server delta as wire bytes.
pub fn delta_frame(op: &DeltaOp, compressed: bool) -> Vec<u8> {
    frame_bytes(&Message::Delta(op.clone()), compressed)
}

/// Decodes wire bytes back into a message.
pub fn decode(bytes: &[u8]) -> Message {
    Frame::from_bytes(bytes)
        .and_then(|frame| frame.to_message())
        .expect("fixture bytes must decode")
}

/// Stamps ops for one connection with consecutive sequences.
///
/// Timestamps advance by `step` per op, starting at `start`.
#[derive(Debug, Clone)]
pub struct OpScript {
    connection: ConnectionId,
    sequence: u64,
    timestamp: u64,
    step: u64,
}

impl OpScript {
    /// Starts a script at sequence 1, timestamp 1000, step 10.
    pub fn new(connection: ConnectionId) -> Self {
        Self::starting_at(connection, 1000, 10)
    }

    /// Starts a script with an explicit clock.
    pub fn starting_at(connection: ConnectionId, start: u64, step: u64) -> Self {
        Self {
            connection,
            sequence: 0,
            timestamp: start,
            step,
        }
    }

    /// Stamps the next op.
    pub fn next(&mut self, body: DeltaBody) -> DeltaOp {
        self.sequence += 1;
        let op = DeltaOp::new(self.connection, self.sequence, self.timestamp, body);
        self.timestamp += self.step;
        op
    }

    /// Skips `count` sequences, as if those ops were lost in transit.
    pub fn skip(&mut self, count: u64) {
        self.sequence += count;
        self.timestamp += self.step * count;
    }

    /// Last sequence handed out.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}
