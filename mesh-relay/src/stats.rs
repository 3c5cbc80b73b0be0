//! Relay counters.
//!
//! Tracked with atomics so the relay hot path never takes a lock for
//! bookkeeping. Read via [`RelayStats::snapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub active_topics: usize,
    pub relayed_envelopes: u64,
    pub dropped_envelopes: u64,
    pub protocol_errors: u64,
}

#[derive(Debug, Default)]
pub struct RelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    relayed_envelopes: AtomicU64,
    dropped_envelopes: AtomicU64,
    protocol_errors: AtomicU64,
}

impl RelayStats {
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn relayed(&self) {
        self.relayed_envelopes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) {
        self.dropped_envelopes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_topics: usize) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            active_topics,
            relayed_envelopes: self.relayed_envelopes.load(Ordering::Relaxed),
            dropped_envelopes: self.dropped_envelopes.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}
