//! Transport layer abstraction for sync connections.

use crate::error::SyncResult;
use async_trait::async_trait;
use graphsync_protocol::ConnectionId;
use std::sync::Arc;

/// Opens duplex links to the sync server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (WebSocket, TCP, in-memory for testing, etc.).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens the link for `connection`, performing any handshake.
    async fn connect(&self, connection: ConnectionId) -> SyncResult<TransportLink>;
}

/// Outbound half of a link.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Sends one encoded frame. `Ok` means the transport accepted it.
    async fn send(&self, frame: Vec<u8>) -> SyncResult<()>;

    /// Closes the link.
    async fn close(&self);
}

/// Inbound half of a link.
#[async_trait]
pub trait FrameStream: Send {
    /// Waits for the next encoded frame; `Ok(None)` means the peer closed.
    async fn recv(&mut self) -> SyncResult<Option<Vec<u8>>>;
}

/// An open link, split into its two halves.
pub struct TransportLink {
    /// Outbound half, shared by every sender.
    pub sink: Arc<dyn FrameSink>,
    /// Inbound half, owned by the connection's reader task.
    pub stream: Box<dyn FrameStream>,
}

impl TransportLink {
    /// Creates a link from its halves.
    pub fn new(sink: Arc<dyn FrameSink>, stream: Box<dyn FrameStream>) -> Self {
        Self { sink, stream }
    }
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink").finish_non_exhaustive()
    }
}
