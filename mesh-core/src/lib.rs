//! # mesh-core — shared vocabulary for the mesh relay and its clients
//!
//! Everything both sides of the wire must agree on lives here:
//!
//! ```text
//! ┌──────────────┐   signal (JSON text)   ┌──────────────┐
//! │ mesh-collab  │ ◄────────────────────► │ mesh-relay   │
//! │ transports   │                        │ rendezvous   │
//! └──────┬───────┘                        └──────────────┘
//!        │  helper (JSON text, base64 payloads)
//!        ▼
//! ┌──────────────┐
//! │ local helper │
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ids`] — server-issued peer identities
//! - [`signal`] — rendezvous/relay control protocol
//! - [`helper`] — delegated-transport control channel
//! - [`observer`] — handler registry with panic isolation
//! - [`error`] — protocol decode errors

pub mod error;
pub mod helper;
pub mod ids;
pub mod observer;
pub mod signal;

pub use error::ProtocolError;
pub use helper::{HelperInbound, HelperOutbound};
pub use ids::PeerId;
pub use observer::{HandlerId, ObserverRegistry};
pub use signal::{ClientMessage, ErrorCode, Outgoing, PeerEntry, Relayed, ServerMessage, SignalKind};
