//! # mesh-relay — rendezvous and negotiation relay
//!
//! Scopes peers to named topics and forwards session-negotiation envelopes
//! between them. Application payloads never pass through here.
//!
//! ## Architecture
//!
//! ```text
//!   GET /ws/{topic}                 ┌───────────────────────────┐
//! ─────────────────► connection ──► │ TopicRegistry (sharded)   │
//!   (one task per    task           │  shard[i]: topic → Topic  │
//!    socket; sole        ▲          │  Topic: peer → PeerHandle │
//!    writer)             │          └────────────┬──────────────┘
//!                        │ bounded queue         │ try_send
//!                        └───────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`] — server configuration
//! - [`registry`] — topic/peer registries and outbound queues
//! - [`envelope`] — validation of client envelopes
//! - [`connection`] — per-socket task
//! - [`server`] — HTTP routes (`/healthz`, `/stats`, `/ws/{topic}`)
//! - [`stats`] — relay counters

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod registry;
pub mod server;
pub mod stats;

pub use config::RelayConfig;
pub use error::RelayError;
pub use registry::{PeerHandle, Topic, TopicRegistry};
pub use server::RelayServer;
pub use stats::StatsSnapshot;
