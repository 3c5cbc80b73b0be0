//! Transport that negotiates a direct session per peer through the relay.
//!
//! ```text
//!   relay ──peer-list / peer-joined──▶ Shared::discovered ──▶ spawn worker
//!   relay ──offer / answer / ice──────▶ Shared::route ──────▶ worker queue
//!                                                                │
//!                     SessionEvent (candidate, open, message) ◀──┘
//!                                │
//!                                ▼
//!                            EventSink ──▶ EventStream
//! ```
//!
//! Of any two peers, the one with the greater id initiates. Each remote peer
//! gets its own worker task with an ordered command queue, so a slow
//! handshake never holds up another peer or the relay link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use mesh_core::{ClientMessage, PeerId, ServerMessage, SignalKind};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::backoff::{LinkState, ReconnectPolicy};
use super::link::{Link, LinkHandler, LinkWriter};
use super::session::{PeerSession, SessionError, SessionEvent, SessionFactory, SessionRole};
use super::{EventSink, EventStream, Peer, PeerTransport, TransportError};

/// How long `connect` waits for the relay's `welcome` once the socket is up.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct NegotiatedConfig {
    /// Base URL of the relay, e.g. `ws://127.0.0.1:9090`.
    pub relay_url: String,
    pub topic: String,
    pub reconnect: ReconnectPolicy,
}

impl NegotiatedConfig {
    pub fn new(relay_url: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            topic: topic.into(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// The relay's WebSocket endpoint for this topic.
    pub fn endpoint(&self) -> String {
        format!("{}/ws/{}", self.relay_url.trim_end_matches('/'), self.topic)
    }
}

/// Whether `local` starts the handshake with `remote`.
pub fn should_initiate(local: &PeerId, remote: &PeerId) -> bool {
    local > remote
}

pub struct NegotiatedTransport {
    shared: Arc<Shared>,
    link: Link,
    events: Mutex<Option<EventStream>>,
}

impl NegotiatedTransport {
    pub fn new(config: NegotiatedConfig, factory: Arc<dyn SessionFactory>) -> Self {
        let (sink, events) = EventSink::new();
        let (self_id, _) = watch::channel(None);
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            factory,
            sink,
            self_id,
            writer: Mutex::new(None),
            peers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        });
        Self {
            shared,
            link: Link::new(config.endpoint(), config.reconnect),
            events: Mutex::new(Some(events)),
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn endpoint(&self) -> &str {
        self.link.url()
    }
}

#[async_trait]
impl PeerTransport for NegotiatedTransport {
    fn self_id(&self) -> Option<PeerId> {
        self.shared.self_id.borrow().clone()
    }

    fn connected_peers(&self) -> Vec<Peer> {
        self.shared
            .sink
            .connected()
            .into_iter()
            .map(|id| Peer { id, connected: true })
            .collect()
    }

    fn send_to(&self, peer: &PeerId, data: &[u8]) -> bool {
        if !self.shared.sink.is_connected(peer) {
            return false;
        }
        let session = self
            .shared
            .peers
            .lock()
            .get(peer)
            .and_then(|slot| slot.session.lock().clone());
        session.is_some_and(|s| s.send(data))
    }

    fn broadcast(&self, data: &[u8]) {
        for peer in self.shared.sink.connected() {
            if !self.send_to(&peer, data) {
                log::debug!("Broadcast to {peer} skipped");
            }
        }
    }

    fn take_events(&self) -> Option<EventStream> {
        self.events.lock().take()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.shared.destroyed.load(Ordering::Acquire) {
            return Err(TransportError::Destroyed);
        }
        self.link.connect(self.shared.clone()).await?;

        let mut self_id = self.shared.self_id.subscribe();
        if tokio::time::timeout(WELCOME_TIMEOUT, welcomed(&mut self_id)).await.is_err() {
            log::warn!("No welcome from {} yet", self.link.url());
        }
        Ok(())
    }

    async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.shutdown().await;
        self.shared.close_all();
        self.shared.sink.seal();
        log::info!("Negotiated transport for {} destroyed", self.link.url());
    }
}

async fn welcomed(rx: &mut watch::Receiver<Option<PeerId>>) {
    loop {
        if rx.borrow_and_update().is_some() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Relay-facing state
// ───────────────────────────────────────────────────────────────────

enum PeerCommand {
    Initiate,
    Offer(Value),
    Answer(Value),
    Candidate(Value),
    Close,
}

type SessionSlot = Arc<Mutex<Option<Arc<dyn PeerSession>>>>;

struct PeerSlot {
    generation: u64,
    commands: mpsc::UnboundedSender<PeerCommand>,
    session: SessionSlot,
}

struct Shared {
    me: Weak<Shared>,
    factory: Arc<dyn SessionFactory>,
    sink: EventSink,
    self_id: watch::Sender<Option<PeerId>>,
    writer: Mutex<Option<LinkWriter>>,
    peers: Mutex<HashMap<PeerId, PeerSlot>>,
    next_generation: AtomicU64,
    destroyed: AtomicBool,
}

impl LinkHandler for Shared {
    fn on_open(&self, writer: LinkWriter) {
        *self.writer.lock() = Some(writer);
    }

    fn on_text(&self, text: &str) {
        match ServerMessage::decode(text) {
            Ok(msg) => self.handle(msg),
            Err(e) => log::warn!("Undecodable relay frame: {e}"),
        }
    }

    fn on_close(&self) {
        *self.writer.lock() = None;
        self.self_id.send_replace(None);
        self.close_all();
    }
}

impl Shared {
    fn local_id(&self) -> Option<PeerId> {
        self.self_id.borrow().clone()
    }

    fn handle(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Welcome { self_id } => {
                log::info!("Relay assigned id {self_id}");
                self.self_id.send_replace(Some(self_id));
            }
            ServerMessage::PeerList { peers } => {
                for entry in peers {
                    self.discovered(entry.id);
                }
            }
            ServerMessage::PeerJoined { peer_id } => self.discovered(peer_id),
            ServerMessage::PeerLeft { peer_id } => {
                log::debug!("Peer {peer_id} left the topic");
                self.close_peer(&peer_id);
            }
            ServerMessage::Offer(env) => self.route(env.from, PeerCommand::Offer(env.payload), true),
            ServerMessage::Answer(env) => self.route(env.from, PeerCommand::Answer(env.payload), false),
            ServerMessage::IceCandidate(env) => {
                self.route(env.from, PeerCommand::Candidate(env.payload), false)
            }
            ServerMessage::Error { code, message, .. } => {
                log::warn!("Relay error {code:?}: {message}");
                self.sink.error(format!("relay error {code:?}: {message}"));
            }
        }
    }

    fn discovered(&self, remote: PeerId) {
        let Some(local) = self.local_id() else {
            log::warn!("Peer {remote} announced before welcome");
            return;
        };
        if remote == local || !should_initiate(&local, &remote) {
            return;
        }
        if self.peers.lock().contains_key(&remote) {
            return;
        }
        if let Some(commands) = self.worker(&remote, true) {
            let _ = commands.send(PeerCommand::Initiate);
        }
    }

    fn route(&self, from: PeerId, command: PeerCommand, create: bool) {
        match self.worker(&from, create) {
            Some(commands) => {
                let _ = commands.send(command);
            }
            None => log::debug!("No session for {from}; signal ignored"),
        }
    }

    /// Command queue for `remote`'s worker, spawning it if asked.
    fn worker(&self, remote: &PeerId, create: bool) -> Option<mpsc::UnboundedSender<PeerCommand>> {
        let mut peers = self.peers.lock();
        if let Some(slot) = peers.get(remote) {
            return Some(slot.commands.clone());
        }
        if !create || self.destroyed.load(Ordering::Acquire) {
            return None;
        }
        let shared = self.me.upgrade()?;
        let local = self.local_id()?;

        let (commands, queue) = mpsc::unbounded_channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let session: SessionSlot = Arc::new(Mutex::new(None));
        peers.insert(
            remote.clone(),
            PeerSlot {
                generation,
                commands: commands.clone(),
                session: session.clone(),
            },
        );
        tokio::spawn(run_peer(shared, local, remote.clone(), generation, queue, session));
        Some(commands)
    }

    fn close_peer(&self, remote: &PeerId) {
        if let Some(slot) = self.peers.lock().remove(remote) {
            let _ = slot.commands.send(PeerCommand::Close);
        }
    }

    /// Release the slot of worker `generation` for `remote`. A newer worker
    /// for the same peer keeps its slot and its connected state.
    fn retire(&self, remote: &PeerId, generation: u64) {
        let mut peers = self.peers.lock();
        match peers.get(remote) {
            Some(slot) if slot.generation != generation => {
                log::debug!("Stale worker for {remote} finished");
                return;
            }
            Some(_) => {
                peers.remove(remote);
            }
            None => {}
        }
        self.sink.peer_disconnected(remote);
    }

    fn close_all(&self) {
        let slots: Vec<PeerSlot> = self.peers.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let _ = slot.commands.send(PeerCommand::Close);
        }
    }

    fn signal(&self, kind: SignalKind, to: &PeerId, payload: Value) {
        let text = match ClientMessage::new(kind, to.clone(), payload).encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Cannot encode {} for {to}: {e}", kind.as_str());
                return;
            }
        };
        let sent = self.writer.lock().as_ref().is_some_and(|w| w.send(text).is_ok());
        if !sent {
            log::warn!("Relay link down; {} to {to} dropped", kind.as_str());
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Per-peer worker
// ───────────────────────────────────────────────────────────────────

struct Worker {
    shared: Arc<Shared>,
    local: PeerId,
    remote: PeerId,
    session: SessionSlot,
    events: mpsc::UnboundedSender<SessionEvent>,
    early_candidates: Vec<Value>,
}

async fn run_peer(
    shared: Arc<Shared>,
    local: PeerId,
    remote: PeerId,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    session: SessionSlot,
) {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut worker = Worker {
        shared: shared.clone(),
        local,
        remote: remote.clone(),
        session,
        events: events_tx,
        early_candidates: Vec::new(),
    };

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match worker.apply(command).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        log::warn!("Session with {remote} failed: {e}");
                        shared.sink.error(format!("session with {remote} failed: {e}"));
                        break;
                    }
                }
            }

            event = events.recv() => match event {
                Some(SessionEvent::LocalCandidate(candidate)) => {
                    shared.signal(SignalKind::IceCandidate, &remote, candidate);
                }
                Some(SessionEvent::ChannelOpen) => {
                    log::info!("Channel to {remote} open");
                    shared.sink.peer_connected(remote.clone());
                }
                Some(SessionEvent::Message(data)) => {
                    shared.sink.message(Some(remote.clone()), data);
                }
                Some(SessionEvent::ChannelClosed) | None => {
                    log::info!("Channel to {remote} closed");
                    break;
                }
                Some(SessionEvent::Failed(reason)) => {
                    log::warn!("Session with {remote} failed: {reason}");
                    shared.sink.error(format!("session with {remote} failed: {reason}"));
                    break;
                }
            }
        }
    }

    let session = worker.session.lock().take();
    if let Some(session) = session {
        session.close().await;
    }
    shared.retire(&remote, generation);
}

impl Worker {
    fn current(&self) -> Option<Arc<dyn PeerSession>> {
        self.session.lock().clone()
    }

    fn open(&self, role: SessionRole) -> Result<Arc<dyn PeerSession>, SessionError> {
        let session = self
            .shared
            .factory
            .create(&self.local, &self.remote, role, self.events.clone())?;
        *self.session.lock() = Some(session.clone());
        Ok(session)
    }

    /// Returns `Ok(false)` when the worker should stop.
    async fn apply(&mut self, command: PeerCommand) -> Result<bool, SessionError> {
        match command {
            PeerCommand::Close => return Ok(false),
            PeerCommand::Initiate => {
                if self.current().is_some() {
                    return Ok(true);
                }
                log::debug!("Offering session to {}", self.remote);
                let session = self.open(SessionRole::Initiator)?;
                let offer = session.create_offer().await?;
                self.shared.signal(SignalKind::Offer, &self.remote, offer);
            }
            PeerCommand::Offer(offer) => {
                if self.current().is_some() {
                    log::warn!("Ignoring offer from {}: session already exists", self.remote);
                    return Ok(true);
                }
                log::debug!("Answering offer from {}", self.remote);
                let session = self.open(SessionRole::Responder)?;
                let answer = session.accept_offer(offer).await?;
                self.shared.signal(SignalKind::Answer, &self.remote, answer);
                for candidate in std::mem::take(&mut self.early_candidates) {
                    session.add_remote_candidate(candidate).await?;
                }
            }
            PeerCommand::Answer(answer) => match self.current() {
                Some(session) => session.accept_answer(answer).await?,
                None => return Err(SessionError::UnexpectedSignal("answer")),
            },
            PeerCommand::Candidate(candidate) => match self.current() {
                Some(session) => session.add_remote_candidate(candidate).await?,
                None => self.early_candidates.push(candidate),
            },
        }
        Ok(true)
    }
}
