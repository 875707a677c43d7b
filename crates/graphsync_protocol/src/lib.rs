//! # graphsync Protocol
//!
//! Wire frames, delta operations and codecs for graphsync.
//!
//! This crate provides:
//! - `DeltaOp` and its closed `DeltaBody` variant for graph replication
//! - Typed protocol messages (delta, submit, heartbeat, resync)
//! - The CBOR `Frame` envelope with optional lz4 payload compression
//! - Content hashing for idempotent retransmit detection
//!
//! This is a pure protocol crate with no I/O operations. Untyped payloads
//! never leave it: `Frame::to_message` either yields a fully typed
//! `Message` or a `ProtocolError`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod compress;
mod error;
mod frame;
mod ids;
mod message;
mod operation;
mod value;

pub use compress::{compress, decompress, MAX_PAYLOAD_SIZE};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{content_hash, Frame, FrameKind};
pub use ids::{ConnectionId, EntityId, SeqStamp};
pub use message::{Heartbeat, LinkState, Message, NodeState, ResyncRequest, ResyncSnapshot};
pub use operation::{DeltaBody, DeltaOp, EntityKind, OpKind, FIRST_SEQUENCE};
pub use value::{AttrValue, Attributes};
