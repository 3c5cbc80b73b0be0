//! Transport-agnostic document sync.
//!
//! - [`message`] — one-byte-tagged sync frames
//! - [`document`] — the replicated document capability and a Yrs implementation
//! - [`awareness`] — ephemeral presence records
//! - [`provider`] — the protocol driver tying a transport to a document

pub mod awareness;
pub mod document;
pub mod message;
pub mod provider;

pub use awareness::{AwarenessMap, AwarenessRecord, UserInfo};
pub use document::{DocumentError, DocumentUpdate, Origin, ReplicatedDocument, YrsDocument};
pub use message::{SyncError, SyncMessage, AWARENESS, SYNC_REQUEST, SYNC_RESPONSE, UPDATE};
pub use provider::{SyncConfig, SyncProvider};
