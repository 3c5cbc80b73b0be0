//! Rendezvous/relay control protocol.
//!
//! JSON text frames, discriminated by a `type` field:
//!
//! ```text
//! server → client   welcome{selfId}
//!                   peer-list{peers:[{id}]}
//!                   peer-joined{peerId} / peer-left{peerId}
//!                   offer|answer|ice-candidate{from, payload, correlationId?}
//!                   error{code, message, correlationId?}
//!
//! client → server   offer|answer|ice-candidate{to, payload, correlationId?}
//! ```
//!
//! Negotiation payloads are opaque JSON; the relay forwards them verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::ids::PeerId;

/// Session-negotiation envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [SignalKind::Offer, SignalKind::Answer, SignalKind::IceCandidate];

    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }

    /// Parse a wire name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

/// Error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed frame or unrecognised `type`.
    InvalidType,
    /// Envelope without a `to` field.
    MissingTarget,
    /// `to` does not name a live member of the sender's topic.
    TargetNotFound,
    /// Target's outbound queue was full; the envelope was discarded.
    Dropped,
}

/// One entry of a `peer-list` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: PeerId,
}

/// A negotiation envelope as delivered to its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relayed {
    pub from: PeerId,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Welcome { self_id: PeerId },

    PeerList { peers: Vec<PeerEntry> },

    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: PeerId },

    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId },

    Offer(Relayed),

    Answer(Relayed),

    IceCandidate(Relayed),

    #[serde(rename_all = "camelCase")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
}

impl ServerMessage {
    /// Wrap a relayed envelope in the frame matching its kind.
    pub fn relayed(kind: SignalKind, envelope: Relayed) -> Self {
        match kind {
            SignalKind::Offer => ServerMessage::Offer(envelope),
            SignalKind::Answer => ServerMessage::Answer(envelope),
            SignalKind::IceCandidate => ServerMessage::IceCandidate(envelope),
        }
    }

    /// Build an `error` frame.
    pub fn error(code: ErrorCode, message: impl Into<String>, correlation_id: Option<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            correlation_id,
        }
    }

    /// The negotiation envelope carried by this frame, if any.
    pub fn as_signal(&self) -> Option<(SignalKind, &Relayed)> {
        match self {
            ServerMessage::Offer(r) => Some((SignalKind::Offer, r)),
            ServerMessage::Answer(r) => Some((SignalKind::Answer, r)),
            ServerMessage::IceCandidate(r) => Some((SignalKind::IceCandidate, r)),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// A negotiation envelope as sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outgoing {
    pub to: PeerId,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Offer(Outgoing),
    Answer(Outgoing),
    IceCandidate(Outgoing),
}

impl ClientMessage {
    pub fn new(kind: SignalKind, to: PeerId, payload: Value) -> Self {
        let envelope = Outgoing {
            to,
            payload,
            correlation_id: None,
        };
        match kind {
            SignalKind::Offer => ClientMessage::Offer(envelope),
            SignalKind::Answer => ClientMessage::Answer(envelope),
            SignalKind::IceCandidate => ClientMessage::IceCandidate(envelope),
        }
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            ClientMessage::Offer(_) => SignalKind::Offer,
            ClientMessage::Answer(_) => SignalKind::Answer,
            ClientMessage::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }

    pub fn envelope(&self) -> &Outgoing {
        match self {
            ClientMessage::Offer(e) | ClientMessage::Answer(e) | ClientMessage::IceCandidate(e) => e,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
