//! Topic and peer registries.
//!
//! Topics are spread over `N` shards, each behind its own `RwLock`, so
//! lookups in unrelated topics never contend. Each [`Topic`] guards its own
//! member map. Lock order is always shard → topic members.
//!
//! Every connection owns a bounded outbound queue. Other tasks only ever
//! `try_send` (or `send_timeout`) into it; the connection's own task is the
//! sole writer to its socket.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use mesh_core::{PeerEntry, PeerId, ServerMessage};
use thiserror::Error;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, RwLock};

/// A pre-encoded text frame, shared between all queues it is fanned out to.
pub type Frame = Arc<str>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("outbound queue full")]
    Full,
    #[error("timed out waiting for outbound queue")]
    Timeout,
    #[error("connection closed")]
    Closed,
}

/// Sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: PeerId,
    outbound: mpsc::Sender<Frame>,
}

impl PeerHandle {
    pub fn new(id: PeerId, outbound: mpsc::Sender<Frame>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Queue a frame without waiting.
    pub fn try_enqueue(&self, frame: Frame) -> Result<(), EnqueueError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Queue a frame, waiting at most `timeout` for room.
    ///
    /// A zero timeout behaves like [`PeerHandle::try_enqueue`].
    pub async fn enqueue(&self, frame: Frame, timeout: Duration) -> Result<(), EnqueueError> {
        if timeout.is_zero() {
            return self.try_enqueue(frame);
        }
        self.outbound.send_timeout(frame, timeout).await.map_err(|e| match e {
            SendTimeoutError::Timeout(_) => EnqueueError::Timeout,
            SendTimeoutError::Closed(_) => EnqueueError::Closed,
        })
    }
}

/// Encode a server frame for fan-out.
pub fn frame(msg: &ServerMessage) -> Option<Frame> {
    match msg.encode() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            log::error!("Failed to encode server frame: {e}");
            None
        }
    }
}

#[derive(Default)]
struct Members {
    peers: HashMap<PeerId, PeerHandle>,
    /// Set once the topic has been unlinked from its shard. Late joiners
    /// that still hold this `Arc` must go back and recreate the topic.
    retired: bool,
}

/// A named room.
pub struct Topic {
    name: String,
    members: RwLock<Members>,
}

impl Topic {
    fn new(name: String) -> Self {
        Self {
            name,
            members: RwLock::new(Members::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit a peer: queue `welcome` and `peer-list` on its own queue, then
    /// announce it to everyone already present.
    ///
    /// Done under the member lock so that no other frame can reach the new
    /// peer ahead of its `welcome`. Returns `None` if this topic was retired
    /// concurrently.
    async fn admit(&self, handle: PeerHandle) -> Option<Vec<PeerId>> {
        let mut members = self.members.write().await;
        if members.retired {
            return None;
        }

        let existing: Vec<PeerId> = members.peers.keys().cloned().collect();

        let welcome = ServerMessage::Welcome { self_id: handle.id().clone() };
        let list = ServerMessage::PeerList {
            peers: existing.iter().cloned().map(|id| PeerEntry { id }).collect(),
        };
        for msg in [welcome, list] {
            if let Some(f) = frame(&msg) {
                if let Err(e) = handle.try_enqueue(f) {
                    log::warn!("Could not queue handshake frame for {}: {e}", handle.id());
                }
            }
        }

        if let Some(f) = frame(&ServerMessage::PeerJoined { peer_id: handle.id().clone() }) {
            fan_out(&members.peers, None, &f);
        }

        members.peers.insert(handle.id().clone(), handle);
        Some(existing)
    }

    /// Remove a peer and announce its departure. Returns the remaining count.
    async fn remove(&self, id: &PeerId) -> Option<usize> {
        let mut members = self.members.write().await;
        members.peers.remove(id)?;
        if let Some(f) = frame(&ServerMessage::PeerLeft { peer_id: id.clone() }) {
            fan_out(&members.peers, None, &f);
        }
        Some(members.peers.len())
    }

    /// Look up a live member.
    pub async fn member(&self, id: &PeerId) -> Option<PeerHandle> {
        self.members.read().await.peers.get(id).cloned()
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.members.read().await.peers.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.peers.is_empty()
    }

    /// Fan a frame out to every member except `except`.
    ///
    /// Returns the number of queues that accepted it.
    pub async fn broadcast(&self, except: Option<&PeerId>, frame: &Frame) -> usize {
        fan_out(&self.members.read().await.peers, except, frame)
    }
}

fn fan_out(peers: &HashMap<PeerId, PeerHandle>, except: Option<&PeerId>, frame: &Frame) -> usize {
    let mut delivered = 0;
    for (id, handle) in peers {
        if Some(id) == except {
            continue;
        }
        match handle.try_enqueue(frame.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => log::warn!("Dropped notice for {id}: {e}"),
        }
    }
    delivered
}

type Shard = RwLock<HashMap<String, Arc<Topic>>>;

/// Sharded map of topic name → [`Topic`].
pub struct TopicRegistry {
    shards: Vec<Shard>,
}

impl TopicRegistry {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, name: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Get or create the topic with the given name.
    pub async fn get_or_create(&self, name: &str) -> Arc<Topic> {
        let shard = self.shard(name);

        // Fast path: read lock
        if let Some(topic) = shard.read().await.get(name) {
            return topic.clone();
        }

        // Slow path: write lock, double-checked
        let mut topics = shard.write().await;
        topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name.to_string())))
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Topic>> {
        self.shard(name).read().await.get(name).cloned()
    }

    /// Register `handle` in `name`, creating the topic if needed.
    ///
    /// Returns the topic and the members that were already present.
    pub async fn join(&self, name: &str, handle: PeerHandle) -> (Arc<Topic>, Vec<PeerId>) {
        loop {
            let topic = self.get_or_create(name).await;
            if let Some(existing) = topic.admit(handle.clone()).await {
                log::info!("Peer {} joined topic {name} ({} already present)", handle.id(), existing.len());
                return (topic, existing);
            }
            // Lost the race against deletion of an emptied topic; recreate.
            log::debug!("Topic {name} retired during join, retrying");
        }
    }

    /// Remove a peer, announce `peer-left`, and drop the topic if it emptied.
    pub async fn leave(&self, topic: &Arc<Topic>, id: &PeerId) -> bool {
        match topic.remove(id).await {
            Some(0) => {
                if self.remove_if_empty(topic).await {
                    log::info!("Topic {} removed (empty)", topic.name());
                }
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Unlink `topic` from its shard if it still has no members.
    pub async fn remove_if_empty(&self, topic: &Arc<Topic>) -> bool {
        let mut topics = self.shard(topic.name()).write().await;
        let mut members = topic.members.write().await;
        let linked = topics.get(topic.name()).is_some_and(|t| Arc::ptr_eq(t, topic));
        if !linked || !members.peers.is_empty() {
            return false;
        }
        members.retired = true;
        topics.remove(topic.name());
        true
    }

    /// Number of live topics.
    pub async fn topic_count(&self) -> usize {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.read().await.len();
        }
        count
    }

    /// Names of all live topics.
    pub async fn topic_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for shard in &self.shards {
            names.extend(shard.read().await.keys().cloned());
        }
        names
    }
}
