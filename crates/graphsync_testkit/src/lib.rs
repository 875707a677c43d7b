//! # graphsync Testkit
//!
//! Test utilities for graphsync.
//!
//! This crate provides:
//! - Op, frame and attribute fixtures
//! - Scripted per-connection op streams with consecutive sequences
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use graphsync_testkit::prelude::*;
//!
//! #[test]
//! fn replays_a_script() {
//!     let mut script = OpScript::new(ConnectionId::new(1));
//!     let add = script.next(DeltaBody::add_node("n1", labelled("A")));
//!     let bytes = delta_frame(&add, false);
//!     // ... feed `bytes` to an ingress
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use graphsync_protocol::{
        AttrValue, Attributes, ConnectionId, DeltaBody, DeltaOp, EntityId, Frame, Message,
    };
}

pub use fixtures::*;
pub use generators::*;
