//! In-process transport for tests and single-process meshes.
//!
//! Every transport created from one [`MemoryHub`] sees every other connected
//! transport from the same hub as a peer. Delivery is immediate and ordered.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mesh_core::PeerId;
use parking_lot::Mutex;

use super::{EventSink, EventStream, Peer, PeerTransport, TransportError};

#[derive(Clone, Default)]
pub struct MemoryHub {
    members: Arc<Mutex<BTreeMap<PeerId, Arc<EventSink>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new, not yet connected transport with a fresh id.
    pub fn transport(&self) -> MemoryTransport {
        let (sink, events) = EventSink::new();
        MemoryTransport {
            id: PeerId::generate(),
            hub: self.clone(),
            sink: Arc::new(sink),
            events: Mutex::new(Some(events)),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    /// Sever the link between two members as if the channel dropped.
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        let members = self.members.lock();
        if let (Some(sa), Some(sb)) = (members.get(a), members.get(b)) {
            sa.peer_disconnected(b);
            sb.peer_disconnected(a);
        }
    }
}

pub struct MemoryTransport {
    id: PeerId,
    hub: MemoryHub,
    sink: Arc<EventSink>,
    events: Mutex<Option<EventStream>>,
    destroyed: AtomicBool,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn self_id(&self) -> Option<PeerId> {
        self.hub.members.lock().contains_key(&self.id).then(|| self.id.clone())
    }

    fn connected_peers(&self) -> Vec<Peer> {
        self.sink
            .connected()
            .into_iter()
            .map(|id| Peer { id, connected: true })
            .collect()
    }

    fn send_to(&self, peer: &PeerId, data: &[u8]) -> bool {
        if !self.sink.is_connected(peer) {
            return false;
        }
        let target = self.hub.members.lock().get(peer).cloned();
        target.is_some_and(|t| t.message(Some(self.id.clone()), data.to_vec()))
    }

    fn broadcast(&self, data: &[u8]) {
        for peer in self.sink.connected() {
            self.send_to(&peer, data);
        }
    }

    fn take_events(&self) -> Option<EventStream> {
        self.events.lock().take()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(TransportError::Destroyed);
        }
        let mut members = self.hub.members.lock();
        if members.contains_key(&self.id) {
            return Ok(());
        }
        for (other, sink) in members.iter() {
            sink.peer_connected(self.id.clone());
            self.sink.peer_connected(other.clone());
        }
        members.insert(self.id.clone(), self.sink.clone());
        Ok(())
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut members = self.hub.members.lock();
        members.remove(&self.id);
        for sink in members.values() {
            sink.peer_disconnected(&self.id);
        }
        drop(members);
        self.sink.seal();
    }
}
