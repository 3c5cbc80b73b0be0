//! In-process session backend.
//!
//! Sessions created from the same [`LoopbackNetwork`] pair up through the
//! offer/answer payloads exchanged over the relay. A side is ready once it
//! holds the remote description and at least one remote candidate; when both
//! sides are ready the channel opens on both at once.
//!
//! All session state lives in one table behind one lock, so readiness and
//! open/close transitions are atomic across the pair.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mesh_core::PeerId;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::session::{PeerSession, SessionError, SessionEvent, SessionFactory, SessionRole};

#[derive(Default)]
struct Table {
    next_id: u64,
    sessions: HashMap<u64, Entry>,
    /// Offer token → initiating session.
    offers: HashMap<String, u64>,
}

struct Entry {
    events: mpsc::UnboundedSender<SessionEvent>,
    counterpart: Option<u64>,
    has_description: bool,
    has_candidate: bool,
    open: bool,
}

impl Entry {
    fn ready(&self) -> bool {
        self.has_description && self.has_candidate
    }
}

impl Table {
    /// Open the channel if both sides of `id`'s pair are ready.
    fn try_open(&mut self, id: u64) {
        let Some(other) = self.sessions.get(&id).and_then(|e| e.counterpart) else { return };
        let both_ready = match (self.sessions.get(&id), self.sessions.get(&other)) {
            (Some(a), Some(b)) => a.ready() && b.ready() && !a.open && !b.open,
            _ => false,
        };
        if !both_ready {
            return;
        }
        for side in [id, other] {
            if let Some(entry) = self.sessions.get_mut(&side) {
                entry.open = true;
                let _ = entry.events.send(SessionEvent::ChannelOpen);
            }
        }
    }

    fn close(&mut self, id: u64) {
        self.offers.retain(|_, owner| *owner != id);
        let Some(entry) = self.sessions.remove(&id) else { return };
        if let Some(other) = entry.counterpart.and_then(|c| self.sessions.get_mut(&c)) {
            other.counterpart = None;
            other.open = false;
            let _ = other.events.send(SessionEvent::ChannelClosed);
        }
    }
}

/// Shared medium for loopback sessions. Clone it into every transport that
/// should be able to reach the others.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    table: Arc<Mutex<Table>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live sessions on this network.
    pub fn session_count(&self) -> usize {
        self.table.lock().sessions.len()
    }

    pub fn open_channels(&self) -> usize {
        self.table.lock().sessions.values().filter(|e| e.open).count()
    }
}

impl SessionFactory for LoopbackNetwork {
    fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        role: SessionRole,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn PeerSession>, SessionError> {
        let mut table = self.table.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.sessions.insert(
            id,
            Entry {
                events,
                counterpart: None,
                has_description: false,
                has_candidate: false,
                open: false,
            },
        );
        log::debug!("Loopback session {id} {local} → {remote} as {role:?}");
        Ok(Arc::new(LoopbackSession {
            id,
            local: local.clone(),
            table: self.table.clone(),
        }))
    }
}

pub struct LoopbackSession {
    id: u64,
    local: PeerId,
    table: Arc<Mutex<Table>>,
}

impl LoopbackSession {
    fn local_candidate(&self, table: &Table) {
        if let Some(entry) = table.sessions.get(&self.id) {
            let candidate = json!({ "candidate": format!("loopback {} {}", self.local, self.id) });
            let _ = entry.events.send(SessionEvent::LocalCandidate(candidate));
        }
    }
}

fn token_of(description: &Value) -> Result<&str, SessionError> {
    description
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| SessionError::InvalidDescription(description.to_string()))
}

#[async_trait]
impl PeerSession for LoopbackSession {
    async fn create_offer(&self) -> Result<Value, SessionError> {
        let mut table = self.table.lock();
        if !table.sessions.contains_key(&self.id) {
            return Err(SessionError::Closed);
        }
        let token = format!("loopback-{}", self.id);
        table.offers.insert(token.clone(), self.id);
        self.local_candidate(&table);
        Ok(json!({ "type": "offer", "token": token }))
    }

    async fn accept_offer(&self, offer: Value) -> Result<Value, SessionError> {
        let token = token_of(&offer)?.to_string();
        let mut table = self.table.lock();
        let initiator = table
            .offers
            .remove(&token)
            .filter(|id| table.sessions.contains_key(id))
            .ok_or_else(|| SessionError::InvalidDescription(format!("unknown offer {token}")))?;

        let entry = table.sessions.get_mut(&self.id).ok_or(SessionError::Closed)?;
        entry.counterpart = Some(initiator);
        entry.has_description = true;
        if let Some(other) = table.sessions.get_mut(&initiator) {
            other.counterpart = Some(self.id);
        }

        self.local_candidate(&table);
        table.try_open(self.id);
        Ok(json!({ "type": "answer", "token": token }))
    }

    async fn accept_answer(&self, answer: Value) -> Result<(), SessionError> {
        let token = token_of(&answer)?;
        if token != format!("loopback-{}", self.id) {
            return Err(SessionError::InvalidDescription(format!("answer for {token}")));
        }
        let mut table = self.table.lock();
        let entry = table.sessions.get_mut(&self.id).ok_or(SessionError::Closed)?;
        if entry.counterpart.is_none() {
            return Err(SessionError::UnexpectedSignal("answer"));
        }
        entry.has_description = true;
        table.try_open(self.id);
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: Value) -> Result<(), SessionError> {
        let mut table = self.table.lock();
        let entry = table.sessions.get_mut(&self.id).ok_or(SessionError::Closed)?;
        entry.has_candidate = true;
        table.try_open(self.id);
        Ok(())
    }

    fn send(&self, data: &[u8]) -> bool {
        let table = self.table.lock();
        let Some(entry) = table.sessions.get(&self.id).filter(|e| e.open) else {
            return false;
        };
        match entry.counterpart.and_then(|c| table.sessions.get(&c)) {
            Some(other) if other.open => other.events.send(SessionEvent::Message(data.to_vec())).is_ok(),
            _ => false,
        }
    }

    async fn close(&self) {
        self.table.lock().close(self.id);
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        self.table.lock().close(self.id);
    }
}
