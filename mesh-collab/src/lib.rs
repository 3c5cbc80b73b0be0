//! # mesh-collab — peer transports and document sync for mesh clients
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────┐  peer-list / offer / answer  ┌──────────────┐
//!   │  mesh-relay  │ ◄──────────────────────────► │ Negotiated   │──┐
//!   └──────────────┘        (WebSocket)           │ Transport    │  │
//!                                                 └──────────────┘  │  PeerTransport
//!   ┌──────────────┐   data / peer-connected      ┌──────────────┐  │  (events, send)
//!   │ local helper │ ◄──────────────────────────► │ Delegated    │──┤
//!   └──────────────┘    (JSON + base64)           │ Transport    │  │
//!                                                 └──────────────┘  ▼
//!                                                       ┌───────────────────┐
//!                                                       │ SyncProvider      │
//!                                                       │ (CRDT + presence) │
//!                                                       └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] — the [`PeerTransport`] contract, reconnect state machine,
//!   negotiated/delegated/in-memory transports and the loopback session backend
//! - [`sync`] — sync wire format, replicated document trait, awareness, provider

pub mod sync;
pub mod transport;

pub use sync::{
    AwarenessRecord, DocumentError, Origin, ReplicatedDocument, SyncConfig, SyncError, SyncMessage,
    SyncProvider, UserInfo, YrsDocument,
};
pub use transport::delegated::{DelegatedConfig, DelegatedTransport};
pub use transport::loopback::LoopbackNetwork;
pub use transport::memory::{MemoryHub, MemoryTransport};
pub use transport::negotiated::{NegotiatedConfig, NegotiatedTransport};
pub use transport::session::{PeerSession, SessionEvent, SessionFactory, SessionRole};
pub use transport::{
    EventSink, EventStream, LinkState, Peer, PeerTransport, ReconnectPolicy, SessionError,
    TransportError, TransportEvent,
};
