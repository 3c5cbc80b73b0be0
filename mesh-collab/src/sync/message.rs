//! Sync wire format.
//!
//! ```text
//! ┌──────────┬──────────────────────────────────────────┐
//! │ tag      │ payload                                  │
//! │ 1 byte   │ variable                                 │
//! └──────────┴──────────────────────────────────────────┘
//!   0 SYNC_REQUEST    (empty)
//!   1 SYNC_RESPONSE   full document state
//!   2 UPDATE          document delta
//!   3 AWARENESS       bincode AwarenessRecord
//! ```

use super::awareness::AwarenessRecord;
use super::document::DocumentError;

pub const SYNC_REQUEST: u8 = 0;
pub const SYNC_RESPONSE: u8 = 1;
pub const UPDATE: u8 = 2;
pub const AWARENESS: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("empty sync message")]
    Empty,

    #[error("unknown sync tag {0}")]
    UnknownTag(u8),

    #[error("awareness encode failed: {0}")]
    AwarenessEncode(#[from] bincode::error::EncodeError),

    #[error("awareness decode failed: {0}")]
    AwarenessDecode(#[from] bincode::error::DecodeError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("transport events were already taken")]
    EventsTaken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    SyncRequest,
    SyncResponse(Vec<u8>),
    Update(Vec<u8>),
    Awareness(AwarenessRecord),
}

impl SyncMessage {
    pub fn tag(&self) -> u8 {
        match self {
            SyncMessage::SyncRequest => SYNC_REQUEST,
            SyncMessage::SyncResponse(_) => SYNC_RESPONSE,
            SyncMessage::Update(_) => UPDATE,
            SyncMessage::Awareness(_) => AWARENESS,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        let mut out = vec![self.tag()];
        match self {
            SyncMessage::SyncRequest => {}
            SyncMessage::SyncResponse(bytes) | SyncMessage::Update(bytes) => {
                out.extend_from_slice(bytes)
            }
            SyncMessage::Awareness(record) => out.extend_from_slice(&record.encode()?),
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (&tag, payload) = bytes.split_first().ok_or(SyncError::Empty)?;
        match tag {
            SYNC_REQUEST => Ok(SyncMessage::SyncRequest),
            SYNC_RESPONSE => Ok(SyncMessage::SyncResponse(payload.to_vec())),
            UPDATE => Ok(SyncMessage::Update(payload.to_vec())),
            AWARENESS => Ok(SyncMessage::Awareness(AwarenessRecord::decode(payload)?)),
            other => Err(SyncError::UnknownTag(other)),
        }
    }
}
