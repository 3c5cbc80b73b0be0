//! Validation of inbound client envelopes.
//!
//! Clients are parsed leniently so that every malformed frame can be answered
//! with a precise error code instead of a dropped connection.

use mesh_core::{ErrorCode, PeerId, SignalKind};
use serde::Deserialize;
use serde_json::Value;

/// A validated negotiation envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub kind: SignalKind,
    pub to: PeerId,
    pub payload: Value,
    pub correlation_id: Option<String>,
}

/// Why an envelope was refused.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub code: ErrorCode,
    pub message: String,
    pub correlation_id: Option<String>,
}

/// Field types are checked after parsing, so a mistyped field still gets
/// its own error code and the correlation id is echoed when usable.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type", default)]
    kind: Value,
    #[serde(default)]
    to: Value,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "correlationId", default)]
    correlation_id: Value,
}

/// Strings are echoed as-is, numbers in their JSON form; anything else is dropped.
fn correlation_id(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_envelope(text: &str) -> Result<InboundEnvelope, Rejection> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(|e| Rejection {
        code: ErrorCode::InvalidType,
        message: format!("malformed frame: {e}"),
        correlation_id: None,
    })?;

    let correlation_id = correlation_id(raw.correlation_id);

    let kind = match raw.kind.as_str().and_then(SignalKind::parse) {
        Some(kind) => kind,
        None => {
            return Err(Rejection {
                code: ErrorCode::InvalidType,
                message: format!("unsupported message type: {}", raw.kind),
                correlation_id,
            })
        }
    };

    let to = match raw.to {
        Value::String(to) if !to.is_empty() => PeerId::new(to),
        _ => {
            return Err(Rejection {
                code: ErrorCode::MissingTarget,
                message: format!("{} without a target", kind.as_str()),
                correlation_id,
            })
        }
    };

    Ok(InboundEnvelope {
        kind,
        to,
        payload: raw.payload,
        correlation_id,
    })
}
