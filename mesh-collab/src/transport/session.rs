//! Pluggable peer-session backend for the negotiated transport.
//!
//! A session is one direct channel to one remote peer. The transport drives
//! the offer/answer/candidate handshake; the backend turns those opaque
//! payloads into a working channel and reports progress as [`SessionEvent`]s.

use std::sync::Arc;

use async_trait::async_trait;
use mesh_core::PeerId;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Creates the data channel and the offer.
    Initiator,
    /// Answers an offer and accepts the remote channel.
    Responder,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A candidate to relay to the remote side.
    LocalCandidate(Value),
    ChannelOpen,
    Message(Vec<u8>),
    ChannelClosed,
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("unexpected {0} in the current session state")]
    UnexpectedSignal(&'static str),

    #[error("session closed")]
    Closed,
}

/// One negotiated channel to a remote peer.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Initiator: produce the offer payload.
    async fn create_offer(&self) -> Result<Value, SessionError>;

    /// Responder: apply the remote offer and produce the answer payload.
    async fn accept_offer(&self, offer: Value) -> Result<Value, SessionError>;

    /// Initiator: apply the remote answer.
    async fn accept_answer(&self, answer: Value) -> Result<(), SessionError>;

    async fn add_remote_candidate(&self, candidate: Value) -> Result<(), SessionError>;

    /// Send over the open channel. `false` if the channel is not open.
    fn send(&self, data: &[u8]) -> bool;

    async fn close(&self);
}

/// Creates sessions for the negotiated transport.
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        role: SessionRole,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn PeerSession>, SessionError>;
}
