//! Wire frame envelope and CBOR codec.

use crate::compress::{compress, decompress, MAX_PAYLOAD_SIZE};
use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::ConnectionId;
use crate::message::{Heartbeat, Message, ResyncRequest, ResyncSnapshot};
use crate::operation::{DeltaBody, DeltaOp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Kind of a wire frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Server → client graph change.
    Delta,
    /// Client → server graph change.
    Submit,
    /// Heartbeat request.
    Ping,
    /// Heartbeat reply.
    Pong,
    /// Full snapshot request.
    ResyncRequest,
    /// Full snapshot response.
    ResyncResponse,
}

impl FrameKind {
    /// Returns true for frames that carry a graph operation.
    pub fn is_operation(&self) -> bool {
        matches!(self, FrameKind::Delta | FrameKind::Submit)
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::Delta => "delta",
            FrameKind::Submit => "submit",
            FrameKind::Ping => "ping",
            FrameKind::Pong => "pong",
            FrameKind::ResyncRequest => "resync_request",
            FrameKind::ResyncResponse => "resync_response",
        };
        f.write_str(name)
    }
}

/// A wire frame.
///
/// The envelope is always plain CBOR. `payload` holds the CBOR body of the
/// message, lz4-compressed when `compressed` is set:
///
/// - `Delta` / `Submit`: the `DeltaBody`; connection, sequence and timestamp
///   come from the envelope
/// - `Ping` / `Pong`: a `Heartbeat`
/// - `ResyncRequest`: a `ResyncRequest`
/// - `ResyncResponse`: a `ResyncSnapshot`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Connection the frame belongs to.
    pub connection_id: ConnectionId,
    /// Envelope sequence number.
    pub sequence: u64,
    /// Envelope timestamp in milliseconds.
    pub timestamp: u64,
    /// Whether `payload` is lz4-compressed.
    pub compressed: bool,
    /// Message body.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a frame carrying `message`.
    pub fn from_message(message: &Message, compressed: bool) -> ProtocolResult<Self> {
        let body = match message {
            Message::Delta(op) | Message::Submit(op) => to_cbor(&op.body)?,
            Message::Ping(hb) | Message::Pong(hb) => to_cbor(hb)?,
            Message::ResyncRequest(req) => to_cbor(req)?,
            Message::ResyncResponse(snap) => to_cbor(snap)?,
        };

        let payload = if compressed { compress(&body) } else { body };

        Ok(Self {
            kind: message.kind(),
            connection_id: message.connection_id(),
            sequence: message.sequence(),
            timestamp: message.timestamp(),
            compressed,
            payload,
        })
    }

    /// Returns the uncompressed payload bytes.
    pub fn payload(&self) -> ProtocolResult<Vec<u8>> {
        if self.compressed {
            decompress(&self.payload)
        } else if self.payload.len() > MAX_PAYLOAD_SIZE {
            Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                limit: MAX_PAYLOAD_SIZE,
            })
        } else {
            Ok(self.payload.clone())
        }
    }

    /// Decodes the typed message along with its uncompressed payload size.
    pub fn open(&self) -> ProtocolResult<(Message, usize)> {
        let payload = self.payload()?;
        let message = match self.kind {
            FrameKind::Delta => Message::Delta(self.operation(&payload)?),
            FrameKind::Submit => Message::Submit(self.operation(&payload)?),
            FrameKind::Ping => Message::Ping(self.control::<Heartbeat>(&payload)?),
            FrameKind::Pong => Message::Pong(self.control::<Heartbeat>(&payload)?),
            FrameKind::ResyncRequest => {
                Message::ResyncRequest(self.control::<ResyncRequest>(&payload)?)
            }
            FrameKind::ResyncResponse => {
                Message::ResyncResponse(self.control::<ResyncSnapshot>(&payload)?)
            }
        };

        if message.connection_id() != self.connection_id {
            return Err(ProtocolError::decode(format!(
                "payload connection {} does not match envelope connection {}",
                message.connection_id(),
                self.connection_id
            )));
        }

        Ok((message, payload.len()))
    }

    /// Decodes the typed message.
    pub fn to_message(&self) -> ProtocolResult<Message> {
        self.open().map(|(message, _)| message)
    }

    /// Encodes the frame to CBOR bytes.
    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes a frame from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }

    fn operation(&self, payload: &[u8]) -> ProtocolResult<DeltaOp> {
        let body: DeltaBody = from_cbor(payload)?;
        Ok(DeltaOp::new(
            self.connection_id,
            self.sequence,
            self.timestamp,
            body,
        ))
    }

    fn control<T: DeserializeOwned>(&self, payload: &[u8]) -> ProtocolResult<T> {
        from_cbor(payload)
    }
}

/// SHA-256 of raw frame bytes, used to recognise idempotent retransmits.
pub fn content_hash(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| ProtocolError::encode(e.to_string()))?;
    Ok(buf)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::EntityId;
    use crate::message::{LinkState, NodeState};
    use crate::value::{AttrValue, Attributes};

    fn labelled(label: &str) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("label".into(), AttrValue::from(label));
        attrs
    }

    fn delta(seq: u64) -> Message {
        Message::Delta(DeltaOp::new(
            ConnectionId::new(1),
            seq,
            100 + seq,
            DeltaBody::add_node("n1", labelled("root")),
        ))
    }

    #[test]
    fn delta_frame_carries_envelope() {
        let frame = Frame::from_message(&delta(3), false).unwrap();
        assert_eq!(frame.kind, FrameKind::Delta);
        assert_eq!(frame.connection_id, ConnectionId::new(1));
        assert_eq!(frame.sequence, 3);
        assert_eq!(frame.timestamp, 103);

        let bytes = frame.to_bytes().unwrap();
        let decoded = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.to_message().unwrap(), delta(3));
    }

    #[test]
    fn compressed_frame_reports_raw_size() {
        let nodes = (0..50)
            .map(|i| NodeState {
                id: EntityId::new(format!("node-{i}")),
                attributes: labelled("a fairly repetitive label"),
            })
            .collect();
        let msg = Message::ResyncResponse(ResyncSnapshot {
            connection_id: ConnectionId::new(4),
            watermark: 99,
            nodes,
            links: vec![LinkState {
                id: "l1".into(),
                source: "node-1".into(),
                target: "node-2".into(),
                attributes: Attributes::new(),
            }],
        });

        let frame = Frame::from_message(&msg, true).unwrap();
        assert!(frame.compressed);
        let (decoded, raw_len) = frame.open().unwrap();
        assert_eq!(decoded, msg);
        assert!(frame.payload.len() < raw_len);
    }

    #[test]
    fn corrupted_compressed_payload_is_an_error() {
        let mut frame = Frame::from_message(&delta(1), true).unwrap();
        let len = frame.payload.len();
        frame.payload.truncate(len / 2);
        assert!(frame.to_message().is_err());
    }

    #[test]
    fn envelope_mismatch_is_rejected() {
        let msg = Message::Ping(Heartbeat::new(ConnectionId::new(1), 9, 0));
        let mut frame = Frame::from_message(&msg, false).unwrap();
        frame.connection_id = ConnectionId::new(2);
        assert!(matches!(
            frame.to_message(),
            Err(ProtocolError::Decode { .. })
        ));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(Frame::from_bytes(&[0xFF, 0x00, 0x13]).is_err());
    }

    #[test]
    fn content_hash_is_stable() {
        let a = Frame::from_message(&delta(1), false).unwrap().to_bytes().unwrap();
        let b = Frame::from_message(&delta(1), false).unwrap().to_bytes().unwrap();
        let c = Frame::from_message(&delta(2), false).unwrap().to_bytes().unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&c));
    }
}
