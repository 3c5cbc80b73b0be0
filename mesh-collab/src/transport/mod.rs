//! Peer transport contract and its implementations.
//!
//! ```text
//!            ┌────────────────────────┐
//!            │     PeerTransport      │  self_id / send_to / broadcast
//!            └───────────┬────────────┘  take_events → EventStream
//!        ┌───────────────┼────────────────┐
//!        ▼               ▼                ▼
//!  NegotiatedTransport  DelegatedTransport  MemoryTransport
//!  (relay + sessions)   (local helper)      (in-process)
//! ```
//!
//! Every implementation routes its events through an [`EventSink`], which
//! enforces per-peer ordering: `PeerConnected` first, then messages, then a
//! single `PeerDisconnected`. Nothing is emitted after the sink is sealed.

pub mod backoff;
pub mod delegated;
mod link;
pub mod loopback;
pub mod memory;
pub mod negotiated;
pub mod session;

use std::collections::HashSet;

use async_trait::async_trait;
use mesh_core::{PeerId, ProtocolError};
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub use backoff::{LinkState, ReconnectPolicy};
pub use session::SessionError;

/// A remote participant as seen by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub connected: bool,
}

/// Events produced by a transport, delivered in order on one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    /// `from` is `None` when the sender is unknown (a helper broadcast).
    Message { from: Option<PeerId>, data: Vec<u8> },
    Error(String),
}

pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport has been destroyed")]
    Destroyed,

    #[error("gave up after {attempts} reconnect attempts")]
    Exhausted { attempts: u32 },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// Byte delivery between peers.
///
/// `send_to` and `broadcast` never fail loudly: an unknown peer or closed
/// channel yields `false` (or is skipped during a broadcast).
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Our identity, `None` until the handshake completes.
    fn self_id(&self) -> Option<PeerId>;

    fn connected_peers(&self) -> Vec<Peer>;

    fn send_to(&self, peer: &PeerId, data: &[u8]) -> bool;

    fn broadcast(&self, data: &[u8]);

    /// Take the event stream. Only the first caller gets it.
    fn take_events(&self) -> Option<EventStream>;

    /// Connect (idempotent). Resolves once the link is up or retries are
    /// exhausted.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Release every peer and stop reconnecting. Safe to call at any time.
    async fn destroy(&self);
}

// ───────────────────────────────────────────────────────────────────
// Event sink
// ───────────────────────────────────────────────────────────────────

struct SinkState {
    tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    connected: HashSet<PeerId>,
}

/// Ordered event emitter shared by a transport's tasks.
///
/// Each method returns whether an event was actually emitted.
pub struct EventSink {
    state: Mutex<SinkState>,
}

impl EventSink {
    pub fn new() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            state: Mutex::new(SinkState {
                tx: Some(tx),
                connected: HashSet::new(),
            }),
        };
        (sink, rx)
    }

    pub fn peer_connected(&self, peer: PeerId) -> bool {
        let mut state = self.state.lock();
        if state.tx.is_none() || state.connected.contains(&peer) {
            return false;
        }
        state.connected.insert(peer.clone());
        emit(&state, TransportEvent::PeerConnected(peer))
    }

    pub fn peer_disconnected(&self, peer: &PeerId) -> bool {
        let mut state = self.state.lock();
        if !state.connected.remove(peer) {
            return false;
        }
        emit(&state, TransportEvent::PeerDisconnected(peer.clone()))
    }

    /// Messages from a peer that is not connected are dropped.
    pub fn message(&self, from: Option<PeerId>, data: Vec<u8>) -> bool {
        let state = self.state.lock();
        if let Some(peer) = &from {
            if !state.connected.contains(peer) {
                log::debug!("Dropping message from unconnected peer {peer}");
                return false;
            }
        }
        emit(&state, TransportEvent::Message { from, data })
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        let state = self.state.lock();
        emit(&state, TransportEvent::Error(message.into()))
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.state.lock().connected.contains(peer)
    }

    /// Connected peers, sorted by id.
    pub fn connected(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.state.lock().connected.iter().cloned().collect();
        peers.sort();
        peers
    }

    /// Emit `PeerDisconnected` for every connected peer.
    pub fn disconnect_all(&self) -> usize {
        release_all(&mut self.state.lock())
    }

    /// Disconnect everyone, then stop emitting for good. Both happen under
    /// one lock, so no peer can connect in between.
    pub fn seal(&self) {
        let mut state = self.state.lock();
        release_all(&mut state);
        state.tx = None;
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().tx.is_none()
    }
}

fn release_all(state: &mut SinkState) -> usize {
    let mut peers: Vec<PeerId> = state.connected.drain().collect();
    peers.sort();
    for peer in &peers {
        emit(state, TransportEvent::PeerDisconnected(peer.clone()));
    }
    peers.len()
}

fn emit(state: &SinkState, event: TransportEvent) -> bool {
    match &state.tx {
        Some(tx) => tx.send(event).is_ok(),
        None => false,
    }
}
