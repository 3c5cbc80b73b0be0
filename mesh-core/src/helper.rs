//! Delegated-transport control channel.
//!
//! A local helper process performs session negotiation on our behalf and
//! talks to us over a text-only WebSocket. Binary payloads therefore travel
//! base64-encoded inside JSON frames:
//!
//! ```text
//! helper → us   welcome{selfId}
//!               peer-connected{peerId} / peer-disconnected{peerId}
//!               data{peerId?, data: base64}      (no peerId ⇒ broadcast-received)
//!               error{message}
//!
//! us → helper   data{peerId?, data: base64}      (no peerId ⇒ broadcast request)
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::ids::PeerId;

/// Frames received from the helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HelperInbound {
    #[serde(rename_all = "camelCase")]
    Welcome { self_id: PeerId },

    #[serde(rename_all = "camelCase")]
    PeerConnected { peer_id: PeerId },

    #[serde(rename_all = "camelCase")]
    PeerDisconnected { peer_id: PeerId },

    #[serde(rename_all = "camelCase")]
    Data {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<PeerId>,
        data: String,
    },

    Error { message: String },
}

impl HelperInbound {
    /// Build a `data` frame carrying `bytes`.
    pub fn data(peer_id: Option<PeerId>, bytes: &[u8]) -> Self {
        HelperInbound::Data {
            peer_id,
            data: encode_payload(bytes),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Frames sent to the helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HelperOutbound {
    #[serde(rename_all = "camelCase")]
    Data {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<PeerId>,
        data: String,
    },
}

impl HelperOutbound {
    /// Unicast (`Some`) or broadcast (`None`) request carrying `bytes`.
    pub fn data(peer_id: Option<PeerId>, bytes: &[u8]) -> Self {
        HelperOutbound::Data {
            peer_id,
            data: encode_payload(bytes),
        }
    }

    /// Decoded payload bytes.
    pub fn payload(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            HelperOutbound::Data { data, .. } => decode_payload(data),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(text: &str) -> Result<Vec<u8>, ProtocolError> {
    Ok(STANDARD.decode(text)?)
}
