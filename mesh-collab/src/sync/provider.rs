//! Document sync over any [`PeerTransport`].
//!
//! ```text
//!  transport events ──▶ event task ──▶ SYNC_REQUEST  → reply SYNC_RESPONSE + AWARENESS
//!                           │          SYNC_RESPONSE → apply (remote)
//!                           │          UPDATE        → apply (remote)
//!                           │          AWARENESS     → awareness map → presence handlers
//!                           └─ tick ──▶ rebroadcast AWARENESS, expire stale records
//!
//!  document (local edit) ──▶ broadcast UPDATE
//! ```
//!
//! Remote-origin updates are never rebroadcast, so updates do not echo
//! around the mesh.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mesh_core::{HandlerId, ObserverRegistry, PeerId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::awareness::{now_millis, AwarenessMap, AwarenessRecord, UserInfo};
use super::document::{DocumentUpdate, Origin, ReplicatedDocument};
use super::message::{SyncError, SyncMessage};
use crate::transport::{EventStream, PeerTransport, TransportEvent};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub local_user: UserInfo,
    /// How often our awareness record is rebroadcast.
    pub awareness_interval: Duration,
    /// Remote records not refreshed within this window are dropped.
    pub awareness_timeout: Duration,
}

impl SyncConfig {
    pub fn new(local_user: UserInfo) -> Self {
        Self {
            local_user,
            awareness_interval: Duration::from_secs(15),
            awareness_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(UserInfo::new("anonymous"))
    }
}

/// Keeps one document in sync with every peer of one transport.
pub struct SyncProvider {
    shared: Arc<Shared>,
    subscription: HandlerId,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    transport: Arc<dyn PeerTransport>,
    document: Arc<dyn ReplicatedDocument>,
    local_user: RwLock<UserInfo>,
    awareness: Mutex<AwarenessMap>,
    presence: ObserverRegistry<Vec<AwarenessRecord>>,
    destroyed: AtomicBool,
}

impl SyncProvider {
    /// Attach to `transport` and `document` and start the event task.
    ///
    /// Fails if the transport's event stream was already taken.
    pub fn start(
        transport: Arc<dyn PeerTransport>,
        document: Arc<dyn ReplicatedDocument>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let events = transport.take_events().ok_or(SyncError::EventsTaken)?;

        let shared = Arc::new(Shared {
            transport,
            document,
            local_user: RwLock::new(config.local_user),
            awareness: Mutex::new(AwarenessMap::new(config.awareness_timeout)),
            presence: ObserverRegistry::new(),
            destroyed: AtomicBool::new(false),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let subscription = shared.document.subscribe(Box::new(move |update: &DocumentUpdate| {
            if let Some(shared) = weak.upgrade() {
                shared.on_document_update(update);
            }
        }));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(shared.clone(), events, config.awareness_interval, shutdown_rx));

        Ok(Self {
            shared,
            subscription,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Replace the local user and announce it immediately.
    pub fn set_local_user(&self, user: UserInfo) {
        *self.shared.local_user.write() = user;
        self.shared.broadcast_awareness();
    }

    pub fn local_record(&self) -> AwarenessRecord {
        self.shared.local_record()
    }

    /// Remote presence, sorted by peer id.
    pub fn awareness_snapshot(&self) -> Vec<AwarenessRecord> {
        self.shared.awareness.lock().snapshot()
    }

    /// Called with a fresh snapshot whenever remote presence changes.
    pub fn on_presence_change<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Vec<AwarenessRecord>) + Send + Sync + 'static,
    {
        self.shared.presence.add(handler)
    }

    pub fn remove_presence_handler(&self, id: HandlerId) -> bool {
        self.shared.presence.remove(id)
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.shared.transport
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    /// Stop the awareness timer, detach from the transport and document,
    /// and clear presence. The transport itself is left running.
    pub async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Sync task ended abnormally: {e}");
            }
        }
        self.shared.document.unsubscribe(self.subscription);
        self.shared.awareness.lock().clear();
        self.shared.presence.clear();
        log::debug!("Sync provider destroyed");
    }
}

async fn run(
    shared: Arc<Shared>,
    mut events: EventStream,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => shared.handle_event(event),
                None => {
                    log::debug!("Transport event stream ended");
                    break;
                }
            },
            _ = tick.tick() => {
                shared.broadcast_awareness();
                shared.expire_stale(Instant::now());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

impl Shared {
    fn local_record(&self) -> AwarenessRecord {
        let user = self.local_user.read().clone();
        let peer_id = self
            .transport
            .self_id()
            .unwrap_or_else(|| PeerId::new(user.id.to_string()));
        AwarenessRecord {
            peer_id,
            user,
            last_updated: now_millis(),
        }
    }

    fn send(&self, to: Option<&PeerId>, msg: &SyncMessage) {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Cannot encode sync message: {e}");
                return;
            }
        };
        match to {
            Some(peer) => {
                if !self.transport.send_to(peer, &bytes) {
                    log::debug!("Sync message {} to {peer} not delivered", msg.tag());
                }
            }
            None => self.transport.broadcast(&bytes),
        }
    }

    fn broadcast_awareness(&self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        log::trace!("Broadcasting awareness");
        self.send(None, &SyncMessage::Awareness(self.local_record()));
    }

    fn on_document_update(&self, update: &DocumentUpdate) {
        if update.origin == Origin::Remote || self.destroyed.load(Ordering::Acquire) {
            return;
        }
        self.send(None, &SyncMessage::Update(update.update.clone()));
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected(peer) => {
                log::debug!("Syncing with {peer}");
                self.send(Some(&peer), &SyncMessage::SyncRequest);
                self.send(Some(&peer), &SyncMessage::Awareness(self.local_record()));
            }
            TransportEvent::PeerDisconnected(peer) => {
                self.awareness.lock().remove(&peer);
                self.notify_presence();
            }
            TransportEvent::Message { from, data } => match SyncMessage::decode(&data) {
                Ok(msg) => self.handle_message(from, msg),
                Err(e) => log::warn!("Discarding sync message from {from:?}: {e}"),
            },
            TransportEvent::Error(message) => log::warn!("Transport error: {message}"),
        }
    }

    fn handle_message(&self, from: Option<PeerId>, msg: SyncMessage) {
        match msg {
            SyncMessage::SyncRequest => {
                let state = SyncMessage::SyncResponse(self.document.encode_state());
                let presence = SyncMessage::Awareness(self.local_record());
                self.send(from.as_ref(), &state);
                self.send(from.as_ref(), &presence);
            }
            SyncMessage::SyncResponse(update) | SyncMessage::Update(update) => {
                if let Err(e) = self.document.apply_update(&update, Origin::Remote) {
                    log::warn!("Rejected update from {from:?}: {e}");
                }
            }
            SyncMessage::Awareness(mut record) => {
                if let Some(peer) = from {
                    record.peer_id = peer;
                }
                if self.transport.self_id().as_ref() == Some(&record.peer_id) {
                    return;
                }
                let changed = self.awareness.lock().upsert(record);
                if changed {
                    self.notify_presence();
                }
            }
        }
    }

    fn expire_stale(&self, now: Instant) {
        let expired = self.awareness.lock().expire(now);
        if !expired.is_empty() {
            log::debug!("Expired presence for {expired:?}");
            self.notify_presence();
        }
    }

    fn notify_presence(&self) {
        let snapshot = self.awareness.lock().snapshot();
        self.presence.notify(&snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::document::YrsDocument;
    use crate::transport::memory::MemoryHub;
    use crate::transport::{Peer, TransportError};
    use async_trait::async_trait;
    use yrs::{GetString, ReadTxn, Text, WriteTxn};

    /// Records outgoing frames; events are pushed by the test.
    struct RecordingTransport {
        sent: Mutex<Vec<(Option<PeerId>, Vec<u8>)>>,
        events: Mutex<Option<EventStream>>,
    }

    impl RecordingTransport {
        fn new() -> (Arc<Self>, tokio::sync::mpsc::UnboundedSender<TransportEvent>) {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            let t = Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                events: Mutex::new(Some(rx)),
            });
            (t, tx)
        }

        fn sent_tags(&self) -> Vec<(Option<PeerId>, u8)> {
            self.sent.lock().iter().map(|(to, b)| (to.clone(), b[0])).collect()
        }
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        fn self_id(&self) -> Option<PeerId> {
            Some(PeerId::new("me"))
        }
        fn connected_peers(&self) -> Vec<Peer> {
            Vec::new()
        }
        fn send_to(&self, peer: &PeerId, data: &[u8]) -> bool {
            self.sent.lock().push((Some(peer.clone()), data.to_vec()));
            true
        }
        fn broadcast(&self, data: &[u8]) {
            self.sent.lock().push((None, data.to_vec()));
        }
        fn take_events(&self) -> Option<EventStream> {
            self.events.lock().take()
        }
        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn destroy(&self) {}
    }

    fn insert(doc: &YrsDocument, chunk: &str) {
        doc.update_local(|txn| {
            let text = txn.get_or_insert_text("body");
            let len = text.len(&*txn);
            text.insert(txn, len, chunk);
        });
    }

    fn text_of(doc: &YrsDocument) -> String {
        let txn = doc.transact();
        txn.get_text("body").map(|t| t.get_string(&txn)).unwrap_or_default()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_peer_connected_sends_request_then_awareness() {
        let (transport, events) = RecordingTransport::new();
        let doc = Arc::new(YrsDocument::new());
        let provider = SyncProvider::start(transport.clone(), doc, SyncConfig::default()).unwrap();

        events.send(TransportEvent::PeerConnected(PeerId::new("p1"))).unwrap();
        settle().await;

        let p1 = Some(PeerId::new("p1"));
        assert_eq!(
            transport.sent_tags(),
            vec![(p1.clone(), crate::sync::SYNC_REQUEST), (p1, crate::sync::AWARENESS)]
        );
        provider.destroy().await;
    }

    #[tokio::test]
    async fn test_sync_request_answered_with_state_and_awareness() {
        let (transport, events) = RecordingTransport::new();
        let doc = Arc::new(YrsDocument::new());
        insert(&doc, "hello");
        let provider = SyncProvider::start(transport.clone(), doc, SyncConfig::default()).unwrap();

        events
            .send(TransportEvent::Message {
                from: Some(PeerId::new("p1")),
                data: SyncMessage::SyncRequest.encode().unwrap(),
            })
            .unwrap();
        settle().await;

        let sent = transport.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        let replica = YrsDocument::new();
        match SyncMessage::decode(&sent[0].1).unwrap() {
            SyncMessage::SyncResponse(state) => replica.apply_update(&state, Origin::Remote).unwrap(),
            other => panic!("expected sync response, got {other:?}"),
        }
        assert_eq!(text_of(&replica), "hello");
        assert_eq!(sent[1].1[0], crate::sync::AWARENESS);
        provider.destroy().await;
    }

    #[tokio::test]
    async fn test_anonymous_request_answered_by_broadcast() {
        let (transport, events) = RecordingTransport::new();
        let provider =
            SyncProvider::start(transport.clone(), Arc::new(YrsDocument::new()), SyncConfig::default()).unwrap();

        events
            .send(TransportEvent::Message { from: None, data: vec![crate::sync::SYNC_REQUEST] })
            .unwrap();
        settle().await;

        assert!(transport.sent_tags().iter().all(|(to, _)| to.is_none()));
        assert_eq!(transport.sent_tags().len(), 2);
        provider.destroy().await;
    }

    #[tokio::test]
    async fn test_remote_updates_are_not_echoed() {
        let (transport, events) = RecordingTransport::new();
        let doc = Arc::new(YrsDocument::new());
        let provider = SyncProvider::start(transport.clone(), doc.clone(), SyncConfig::default()).unwrap();

        let source = YrsDocument::new();
        insert(&source, "remote text");
        events
            .send(TransportEvent::Message {
                from: Some(PeerId::new("p1")),
                data: SyncMessage::Update(source.encode_state()).encode().unwrap(),
            })
            .unwrap();
        settle().await;

        assert_eq!(text_of(&doc), "remote text");
        assert!(transport.sent.lock().is_empty());

        insert(&doc, "!");
        assert_eq!(transport.sent_tags(), vec![(None, crate::sync::UPDATE)]);
        provider.destroy().await;
    }

    #[tokio::test]
    async fn test_bad_messages_are_discarded() {
        let (transport, events) = RecordingTransport::new();
        let doc = Arc::new(YrsDocument::new());
        let provider = SyncProvider::start(transport.clone(), doc.clone(), SyncConfig::default()).unwrap();

        let p1 = Some(PeerId::new("p1"));
        for data in [vec![], vec![42], vec![crate::sync::UPDATE, 0xff, 0xff], vec![crate::sync::AWARENESS, 1]] {
            events.send(TransportEvent::Message { from: p1.clone(), data }).unwrap();
        }
        events.send(TransportEvent::Message { from: p1.clone(), data: vec![crate::sync::SYNC_REQUEST] }).unwrap();
        settle().await;

        // Still processing: the valid request got its two replies.
        assert_eq!(transport.sent.lock().len(), 2);
        assert!(provider.awareness_snapshot().is_empty());
        provider.destroy().await;
    }

    #[tokio::test]
    async fn test_awareness_removed_on_disconnect() {
        let (transport, events) = RecordingTransport::new();
        let provider =
            SyncProvider::start(transport.clone(), Arc::new(YrsDocument::new()), SyncConfig::default()).unwrap();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let seen = changes.clone();
        provider.on_presence_change(move |snapshot| seen.lock().push(snapshot.len()));

        let p1 = PeerId::new("p1");
        let record = AwarenessRecord::new(PeerId::new("spoofed"), UserInfo::new("Ada"));
        events.send(TransportEvent::PeerConnected(p1.clone())).unwrap();
        events
            .send(TransportEvent::Message {
                from: Some(p1.clone()),
                data: SyncMessage::Awareness(record).encode().unwrap(),
            })
            .unwrap();
        settle().await;

        let snapshot = provider.awareness_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].peer_id, p1);
        assert_eq!(snapshot[0].user.display_name, "Ada");

        events.send(TransportEvent::PeerDisconnected(p1)).unwrap();
        settle().await;
        assert!(provider.awareness_snapshot().is_empty());
        assert_eq!(*changes.lock(), vec![1, 0]);
        provider.destroy().await;
    }

    #[tokio::test]
    async fn test_set_local_user_broadcasts_immediately() {
        let (transport, _events) = RecordingTransport::new();
        let provider =
            SyncProvider::start(transport.clone(), Arc::new(YrsDocument::new()), SyncConfig::default()).unwrap();

        provider.set_local_user(UserInfo::new("Grace"));
        let sent = transport.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        match SyncMessage::decode(&sent[0].1).unwrap() {
            SyncMessage::Awareness(record) => {
                assert_eq!(record.user.display_name, "Grace");
                assert_eq!(record.peer_id, PeerId::new("me"));
            }
            other => panic!("expected awareness, got {other:?}"),
        }
        provider.destroy().await;
    }

    #[tokio::test]
    async fn test_awareness_rebroadcast_on_interval() {
        let (transport, _events) = RecordingTransport::new();
        let config = SyncConfig {
            awareness_interval: Duration::from_millis(20),
            ..SyncConfig::default()
        };
        let provider = SyncProvider::start(transport.clone(), Arc::new(YrsDocument::new()), config).unwrap();

        tokio::time::sleep(Duration::from_millis(110)).await;
        let broadcasts = transport.sent_tags().iter().filter(|(to, _)| to.is_none()).count();
        assert!(broadcasts >= 2, "only {broadcasts} broadcasts");
        provider.destroy().await;
    }

    #[tokio::test]
    async fn test_silent_peer_expires() {
        let (transport, events) = RecordingTransport::new();
        let config = SyncConfig {
            awareness_interval: Duration::from_millis(20),
            awareness_timeout: Duration::from_millis(40),
            ..SyncConfig::default()
        };
        let provider = SyncProvider::start(transport.clone(), Arc::new(YrsDocument::new()), config).unwrap();

        let p1 = PeerId::new("p1");
        events.send(TransportEvent::PeerConnected(p1.clone())).unwrap();
        events
            .send(TransportEvent::Message {
                from: Some(p1.clone()),
                data: SyncMessage::Awareness(AwarenessRecord::new(p1, UserInfo::new("Ada"))).encode().unwrap(),
            })
            .unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(provider.awareness_snapshot().is_empty());
        provider.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_detaches() {
        let (transport, events) = RecordingTransport::new();
        let doc = Arc::new(YrsDocument::new());
        let provider = SyncProvider::start(transport.clone(), doc.clone(), SyncConfig::default()).unwrap();

        provider.destroy().await;
        provider.destroy().await;
        assert!(provider.is_destroyed());

        insert(&doc, "after");
        let _ = events.send(TransportEvent::PeerConnected(PeerId::new("p1")));
        settle().await;
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_events_taken_twice_fails() {
        let (transport, _events) = RecordingTransport::new();
        let first = SyncProvider::start(transport.clone(), Arc::new(YrsDocument::new()), SyncConfig::default());
        assert!(first.is_ok());
        let second = SyncProvider::start(transport, Arc::new(YrsDocument::new()), SyncConfig::default());
        assert!(matches!(second, Err(SyncError::EventsTaken)));
    }

    #[tokio::test]
    async fn test_two_providers_converge_over_memory_hub() {
        let hub = MemoryHub::new();
        let ta = Arc::new(hub.transport());
        let tb = Arc::new(hub.transport());
        let da = Arc::new(YrsDocument::new());
        let db = Arc::new(YrsDocument::new());
        insert(&da, "from a;");
        insert(&db, "from b;");

        let pa = SyncProvider::start(ta.clone(), da.clone(), SyncConfig::new(UserInfo::new("A"))).unwrap();
        let pb = SyncProvider::start(tb.clone(), db.clone(), SyncConfig::new(UserInfo::new("B"))).unwrap();
        ta.connect().await.unwrap();
        tb.connect().await.unwrap();
        settle().await;

        assert_eq!(text_of(&da), text_of(&db));
        assert_eq!(text_of(&da).len(), "from a;from b;".len());
        assert_eq!(pa.awareness_snapshot()[0].user.display_name, "B");
        assert_eq!(pb.awareness_snapshot()[0].user.display_name, "A");

        insert(&da, " more");
        settle().await;
        assert_eq!(text_of(&da), text_of(&db));

        pa.destroy().await;
        pb.destroy().await;
    }
}
