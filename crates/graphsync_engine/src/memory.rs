//! In-process transport and loopback server.
//!
//! [`MemoryServer`] plays the authoritative side of the protocol inside the
//! test process: it keeps its own copy of the graph, answers pings and
//! resync requests, records every submitted op, and lets tests inject,
//! duplicate or drop frames and connections at will.

use crate::error::{SyncError, SyncResult};
use crate::transport::{Connector, FrameSink, FrameStream, TransportLink};
use crate::unix_millis;
use async_trait::async_trait;
use graphsync_protocol::{
    Attributes, ConnectionId, DeltaBody, DeltaOp, EntityId, Frame, LinkState, Message, NodeState,
    ResyncRequest, ResyncSnapshot, FIRST_SEQUENCE,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A loopback sync server living in the same process.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

struct ServerState {
    links: BTreeMap<ConnectionId, ServerLink>,
    sequences: BTreeMap<ConnectionId, u64>,
    received: Vec<(ConnectionId, Message)>,
    nodes: BTreeMap<EntityId, NodeState>,
    graph_links: BTreeMap<EntityId, LinkState>,
    refuse_connects: u32,
    offline: bool,
    fail_sends: bool,
    auto_pong: bool,
    auto_resync: bool,
    compress: bool,
    connect_attempts: u64,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            links: BTreeMap::new(),
            sequences: BTreeMap::new(),
            received: Vec::new(),
            nodes: BTreeMap::new(),
            graph_links: BTreeMap::new(),
            refuse_connects: 0,
            offline: false,
            fail_sends: false,
            auto_pong: true,
            auto_resync: true,
            compress: false,
            connect_attempts: 0,
        }
    }
}

struct ServerLink {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    alive: Arc<AtomicBool>,
}

impl MemoryServer {
    /// Creates a server that accepts every connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a connector that opens links to this server.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
        }
    }

    /// Sends a delta on `connection` with the next sequence number.
    ///
    /// The op is applied to the server's graph first. Returns the sequence.
    pub fn send_delta(&self, connection: ConnectionId, body: DeltaBody) -> SyncResult<u64> {
        self.send_delta_at(connection, unix_millis(), body)
    }

    /// Like [`send_delta`](Self::send_delta) with an explicit timestamp.
    pub fn send_delta_at(
        &self,
        connection: ConnectionId,
        timestamp: u64,
        body: DeltaBody,
    ) -> SyncResult<u64> {
        let mut state = self.state.lock();
        let sequence = state.sequences.entry(connection).or_insert(0);
        *sequence += 1;
        let op = DeltaOp::new(connection, *sequence, timestamp, body);
        state.apply(&op.body);
        let sequence = op.sequence;
        state.deliver_message(connection, &Message::Delta(op))?;
        Ok(sequence)
    }

    /// Applies a delta and consumes its sequence without delivering it, as
    /// if the frame was lost in transit. Returns the sequence.
    pub fn lose_delta(&self, connection: ConnectionId, body: DeltaBody) -> u64 {
        let mut state = self.state.lock();
        state.apply(&body);
        let sequence = state.sequences.entry(connection).or_insert(0);
        *sequence += 1;
        *sequence
    }

    /// Sends a delta exactly as given, without touching the server's
    /// sequence counter or graph. Used to replay, reorder or duplicate.
    pub fn send_op(&self, op: DeltaOp) -> SyncResult<()> {
        let connection = op.connection_id;
        self.state
            .lock()
            .deliver_message(connection, &Message::Delta(op))
    }

    /// Sends an arbitrary message on `connection`.
    pub fn send_message(&self, connection: ConnectionId, message: &Message) -> SyncResult<()> {
        self.state.lock().deliver_message(connection, message)
    }

    /// Sends raw bytes on `connection`, bypassing the codec.
    pub fn send_raw(&self, connection: ConnectionId, bytes: Vec<u8>) -> SyncResult<()> {
        self.state.lock().deliver(connection, bytes)
    }

    /// Closes the server side of `connection`.
    pub fn drop_connection(&self, connection: ConnectionId) {
        let mut state = self.state.lock();
        if let Some(link) = state.links.remove(&connection) {
            link.alive.store(false, Ordering::SeqCst);
            debug!(%connection, "memory server dropped link");
        }
    }

    /// Refuses every new connection while `offline` is true.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_connects(&self, count: u32) {
        self.state.lock().refuse_connects = count;
    }

    /// Rejects every client send while `fail` is true.
    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Enables or disables automatic pong replies.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.state.lock().auto_pong = enabled;
    }

    /// Enables or disables automatic resync responses.
    pub fn set_auto_resync(&self, enabled: bool) {
        self.state.lock().auto_resync = enabled;
    }

    /// Enables or disables compression of server frames.
    pub fn set_compression(&self, enabled: bool) {
        self.state.lock().compress = enabled;
    }

    /// Replaces the server's graph.
    pub fn set_graph(&self, nodes: Vec<NodeState>, links: Vec<LinkState>) {
        let mut state = self.state.lock();
        state.nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        state.graph_links = links.into_iter().map(|l| (l.id.clone(), l)).collect();
    }

    /// Builds the snapshot the server would send for `connection`.
    pub fn snapshot_for(&self, connection: ConnectionId) -> ResyncSnapshot {
        self.state.lock().snapshot_for(connection)
    }

    /// Ops submitted by clients, in arrival order.
    pub fn submitted(&self) -> Vec<DeltaOp> {
        self.state
            .lock()
            .received
            .iter()
            .filter_map(|(_, message)| match message {
                Message::Submit(op) => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    /// Resync requests received, in arrival order.
    pub fn resync_requests(&self) -> Vec<ResyncRequest> {
        self.state
            .lock()
            .received
            .iter()
            .filter_map(|(_, message)| match message {
                Message::ResyncRequest(req) => Some(*req),
                _ => None,
            })
            .collect()
    }

    /// Number of pings received.
    pub fn pings_received(&self) -> usize {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(_, message)| matches!(message, Message::Ping(_)))
            .count()
    }

    /// Number of pongs received.
    pub fn pongs_received(&self) -> usize {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(_, message)| matches!(message, Message::Pong(_)))
            .count()
    }

    /// Number of connection attempts seen, refused ones included.
    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }

    /// Returns true if `connection` currently has an open link.
    pub fn is_linked(&self, connection: ConnectionId) -> bool {
        self.state.lock().links.contains_key(&connection)
    }

    /// Returns the server's copy of a node.
    pub fn node(&self, id: &str) -> Option<NodeState> {
        self.state.lock().nodes.get(&EntityId::from(id)).cloned()
    }

    /// Returns the server's copy of a link.
    pub fn link(&self, id: &str) -> Option<LinkState> {
        self.state.lock().graph_links.get(&EntityId::from(id)).cloned()
    }

    fn open(&self, connection: ConnectionId) -> SyncResult<TransportLink> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;

        if state.offline {
            return Err(SyncError::transport_retryable("server offline"));
        }
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(SyncError::transport_retryable("connection refused"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        if let Some(old) = state.links.insert(
            connection,
            ServerLink {
                outbound: tx,
                alive: Arc::clone(&alive),
            },
        ) {
            old.alive.store(false, Ordering::SeqCst);
        }
        // Each link starts a fresh sequence stream
        state.sequences.insert(connection, FIRST_SEQUENCE - 1);

        let sink = MemorySink {
            server: self.clone(),
            connection,
            alive,
        };
        Ok(TransportLink::new(Arc::new(sink), Box::new(MemoryStream { rx })))
    }

    fn receive(&self, connection: ConnectionId, bytes: &[u8]) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(SyncError::transport_retryable("send rejected"));
        }

        let message = Frame::from_bytes(bytes)?.to_message()?;
        match &message {
            Message::Ping(hb) if state.auto_pong => {
                let _ = state.deliver_message(connection, &Message::Pong(*hb));
            }
            Message::Submit(op) => state.apply(&op.body),
            Message::ResyncRequest(_) if state.auto_resync => {
                let snapshot = state.snapshot_for(connection);
                let _ = state.deliver_message(connection, &Message::ResyncResponse(snapshot));
            }
            _ => {}
        }
        state.received.push((connection, message));
        Ok(())
    }
}

impl ServerState {
    fn deliver_message(&mut self, connection: ConnectionId, message: &Message) -> SyncResult<()> {
        let bytes = Frame::from_message(message, self.compress)?.to_bytes()?;
        self.deliver(connection, bytes)
    }

    fn deliver(&mut self, connection: ConnectionId, bytes: Vec<u8>) -> SyncResult<()> {
        let link = self
            .links
            .get(&connection)
            .ok_or(SyncError::NotConnected)?;
        link.outbound
            .send(bytes)
            .map_err(|_| SyncError::transport_retryable("client hung up"))
    }

    fn snapshot_for(&self, connection: ConnectionId) -> ResyncSnapshot {
        ResyncSnapshot {
            connection_id: connection,
            watermark: self.sequences.get(&connection).copied().unwrap_or(0),
            nodes: self.nodes.values().cloned().collect(),
            links: self.graph_links.values().cloned().collect(),
        }
    }

    fn apply(&mut self, body: &DeltaBody) {
        match body {
            DeltaBody::AddNode { id, attributes } => {
                let node = self.nodes.entry(id.clone()).or_insert_with(|| NodeState {
                    id: id.clone(),
                    attributes: Attributes::new(),
                });
                merge_attributes(&mut node.attributes, attributes);
            }
            DeltaBody::UpdateNode { id, changes } => {
                if let Some(node) = self.nodes.get_mut(id) {
                    merge_attributes(&mut node.attributes, changes);
                }
            }
            DeltaBody::RemoveNode { id } => {
                self.nodes.remove(id);
                self.graph_links
                    .retain(|_, link| link.source != *id && link.target != *id);
            }
            DeltaBody::AddLink {
                id,
                source,
                target,
                attributes,
            } => {
                let link = self
                    .graph_links
                    .entry(id.clone())
                    .or_insert_with(|| LinkState {
                        id: id.clone(),
                        source: source.clone(),
                        target: target.clone(),
                        attributes: Attributes::new(),
                    });
                merge_attributes(&mut link.attributes, attributes);
            }
            DeltaBody::UpdateLink { id, changes } => {
                if let Some(link) = self.graph_links.get_mut(id) {
                    merge_attributes(&mut link.attributes, changes);
                }
            }
            DeltaBody::RemoveLink { id } => {
                self.graph_links.remove(id);
            }
        }
    }
}

fn merge_attributes(target: &mut Attributes, changes: &Attributes) {
    for (key, value) in changes {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Opens links to a [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, connection: ConnectionId) -> SyncResult<TransportLink> {
        self.server.open(connection)
    }
}

struct MemorySink {
    server: MemoryServer,
    connection: ConnectionId,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&self, frame: Vec<u8>) -> SyncResult<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("link closed"));
        }
        self.server.receive(self.connection, &frame)
    }

    async fn close(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut state = self.server.state.lock();
        let ours = state
            .links
            .get(&self.connection)
            .is_some_and(|link| Arc::ptr_eq(&link.alive, &self.alive));
        if ours {
            state.links.remove(&self.connection);
        }
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}
