//! Protocol decode errors.

use thiserror::Error;

/// Errors raised while encoding or decoding control-channel frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}
