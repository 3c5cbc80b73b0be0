//! Presence records and the per-client map that holds them.
//!
//! Records are ephemeral. A peer's record disappears when the peer
//! disconnects, or when it has not been refreshed within the timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mesh_core::PeerId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Self-asserted user identity. Not authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Uuid,
    pub display_name: String,
}

impl UserInfo {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessRecord {
    pub peer_id: PeerId,
    pub user: UserInfo,
    /// Sender's wall clock, milliseconds since the Unix epoch.
    pub last_updated: u64,
}

impl AwarenessRecord {
    pub fn new(peer_id: PeerId, user: UserInfo) -> Self {
        Self {
            peer_id,
            user,
            last_updated: now_millis(),
        }
    }

    /// Encode to binary (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode from binary.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(record)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

struct Entry {
    record: AwarenessRecord,
    received: Instant,
}

/// Remote presence keyed by peer id.
pub struct AwarenessMap {
    entries: HashMap<PeerId, Entry>,
    timeout: Duration,
}

impl AwarenessMap {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Insert or refresh a record. Returns `true` if the visible state
    /// changed. Records older than the one held are ignored.
    pub fn upsert(&mut self, record: AwarenessRecord) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(&record.peer_id) {
            Some(entry) if record.last_updated < entry.record.last_updated => false,
            Some(entry) => {
                entry.received = now;
                let changed = entry.record.user != record.user;
                entry.record = record;
                changed
            }
            None => {
                self.entries.insert(
                    record.peer_id.clone(),
                    Entry {
                        record,
                        received: now,
                    },
                );
                true
            }
        }
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<AwarenessRecord> {
        self.entries.remove(peer).map(|e| e.record)
    }

    /// Drop records not refreshed within the timeout as of `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<PeerId> {
        let timeout = self.timeout;
        let stale: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.received) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.entries.remove(id);
        }
        stale
    }

    pub fn get(&self, peer: &PeerId) -> Option<&AwarenessRecord> {
        self.entries.get(peer).map(|e| &e.record)
    }

    /// All records, sorted by peer id.
    pub fn snapshot(&self) -> Vec<AwarenessRecord> {
        let mut records: Vec<AwarenessRecord> = self.entries.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        records
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
