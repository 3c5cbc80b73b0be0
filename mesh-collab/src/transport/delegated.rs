//! Transport that delegates peer sessions to a local helper process.
//!
//! The helper speaks JSON text frames over a WebSocket and carries binary
//! payloads as base64. This side performs no negotiation: its peer set is
//! exactly what the helper reports through `peer-connected` and
//! `peer-disconnected`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mesh_core::{HelperInbound, HelperOutbound, PeerId};
use parking_lot::{Mutex, RwLock};

use super::backoff::{LinkState, ReconnectPolicy};
use super::link::{Link, LinkHandler, LinkWriter};
use super::{EventSink, EventStream, Peer, PeerTransport, TransportError};

#[derive(Debug, Clone)]
pub struct DelegatedConfig {
    /// The helper's WebSocket URL, e.g. `ws://127.0.0.1:4455`.
    pub helper_url: String,
    pub reconnect: ReconnectPolicy,
}

impl DelegatedConfig {
    pub fn new(helper_url: impl Into<String>) -> Self {
        Self {
            helper_url: helper_url.into(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

pub struct DelegatedTransport {
    helper: Arc<Helper>,
    link: Link,
    events: Mutex<Option<EventStream>>,
    destroyed: AtomicBool,
}

impl DelegatedTransport {
    pub fn new(config: DelegatedConfig) -> Self {
        let (sink, events) = EventSink::new();
        Self {
            helper: Arc::new(Helper {
                sink,
                self_id: RwLock::new(None),
                writer: Mutex::new(None),
            }),
            link: Link::new(config.helper_url, config.reconnect),
            events: Mutex::new(Some(events)),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }
}

#[async_trait]
impl PeerTransport for DelegatedTransport {
    fn self_id(&self) -> Option<PeerId> {
        self.helper.self_id.read().clone()
    }

    fn connected_peers(&self) -> Vec<Peer> {
        self.helper
            .sink
            .connected()
            .into_iter()
            .map(|id| Peer { id, connected: true })
            .collect()
    }

    fn send_to(&self, peer: &PeerId, data: &[u8]) -> bool {
        if !self.helper.sink.is_connected(peer) {
            return false;
        }
        self.helper.send(HelperOutbound::data(Some(peer.clone()), data))
    }

    fn broadcast(&self, data: &[u8]) {
        if !self.helper.send(HelperOutbound::data(None, data)) {
            log::debug!("Broadcast dropped; helper link is down");
        }
    }

    fn take_events(&self) -> Option<EventStream> {
        self.events.lock().take()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(TransportError::Destroyed);
        }
        self.link.connect(self.helper.clone()).await
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.shutdown().await;
        self.helper.sink.seal();
        log::info!("Delegated transport for {} destroyed", self.link.url());
    }
}

struct Helper {
    sink: EventSink,
    self_id: RwLock<Option<PeerId>>,
    writer: Mutex<Option<LinkWriter>>,
}

impl Helper {
    fn send(&self, frame: HelperOutbound) -> bool {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Cannot encode helper frame: {e}");
                return false;
            }
        };
        self.writer.lock().as_ref().is_some_and(|w| w.send(text).is_ok())
    }

    fn handle(&self, frame: HelperInbound) {
        match frame {
            HelperInbound::Welcome { self_id } => {
                log::info!("Helper assigned id {self_id}");
                *self.self_id.write() = Some(self_id);
            }
            HelperInbound::PeerConnected { peer_id } => {
                log::debug!("Helper connected {peer_id}");
                self.sink.peer_connected(peer_id);
            }
            HelperInbound::PeerDisconnected { peer_id } => {
                log::debug!("Helper disconnected {peer_id}");
                self.sink.peer_disconnected(&peer_id);
            }
            HelperInbound::Data { peer_id, data } => match mesh_core::helper::decode_payload(&data) {
                Ok(bytes) => {
                    self.sink.message(peer_id, bytes);
                }
                Err(e) => log::warn!("Discarding helper data with bad payload: {e}"),
            },
            HelperInbound::Error { message } => {
                log::warn!("Helper error: {message}");
                self.sink.error(message);
            }
        }
    }
}

impl LinkHandler for Helper {
    fn on_open(&self, writer: LinkWriter) {
        *self.writer.lock() = Some(writer);
    }

    fn on_text(&self, text: &str) {
        match HelperInbound::decode(text) {
            Ok(frame) => self.handle(frame),
            Err(e) => log::warn!("Discarding helper frame: {e}"),
        }
    }

    fn on_close(&self) {
        *self.writer.lock() = None;
        *self.self_id.write() = None;
        let dropped = self.sink.disconnect_all();
        if dropped > 0 {
            log::info!("Helper link closed; {dropped} peers disconnected");
        }
    }
}
