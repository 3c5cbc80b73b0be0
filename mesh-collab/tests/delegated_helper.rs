//! Delegated transport against a scripted helper.
//!
//! The helper here is a bare WebSocket server; each test drives it frame
//! by frame and watches what the transport emits.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mesh_collab::{
    DelegatedConfig, DelegatedTransport, EventStream, LinkState, PeerTransport, ReconnectPolicy,
    TransportError, TransportEvent,
};
use mesh_core::{HelperInbound, HelperOutbound, PeerId};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type HelperSocket = WebSocketStream<TcpStream>;

/// Accept helper connections on a free port; each accepted socket is
/// handed to the test through the returned channel.
async fn start_helper() -> (SocketAddr, mpsc::UnboundedReceiver<HelperSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                if tx.send(ws).is_err() {
                    break;
                }
            }
        }
    });
    (addr, rx)
}

fn fast_config(addr: SocketAddr) -> DelegatedConfig {
    let mut config = DelegatedConfig::new(format!("ws://{addr}"));
    config.reconnect = ReconnectPolicy {
        base_delay: Duration::from_millis(20),
        max_attempts: 3,
    };
    config
}

async fn accepted(sockets: &mut mpsc::UnboundedReceiver<HelperSocket>) -> HelperSocket {
    timeout(Duration::from_secs(5), sockets.recv())
        .await
        .expect("transport never connected")
        .unwrap()
}

async fn push(ws: &mut HelperSocket, frame: HelperInbound) {
    ws.send(Message::text(frame.encode().unwrap())).await.unwrap();
}

async fn pull(ws: &mut HelperSocket) -> HelperOutbound {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a helper frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return HelperOutbound::decode(text.as_str()).unwrap();
        }
    }
}

async fn next_event(events: &mut EventStream) -> TransportEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream ended")
}

async fn wait_for_self_id(t: &DelegatedTransport) -> PeerId {
    timeout(Duration::from_secs(2), async {
        loop {
            if let Some(id) = t.self_id() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no welcome processed")
}

#[tokio::test]
async fn test_peer_set_and_inbound_data() {
    let (addr, mut sockets) = start_helper().await;
    let t = DelegatedTransport::new(fast_config(addr));
    let mut events = t.take_events().unwrap();

    t.connect().await.unwrap();
    let mut helper = accepted(&mut sockets).await;
    assert_eq!(t.link_state(), LinkState::Connected);

    push(&mut helper, HelperInbound::Welcome { self_id: PeerId::new("me") }).await;
    assert_eq!(wait_for_self_id(&t).await, PeerId::new("me"));

    push(&mut helper, HelperInbound::PeerConnected { peer_id: PeerId::new("p1") }).await;
    assert_eq!(next_event(&mut events).await, TransportEvent::PeerConnected(PeerId::new("p1")));

    push(&mut helper, HelperInbound::data(Some(PeerId::new("p1")), &[1, 2, 3])).await;
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Message { from: Some(PeerId::new("p1")), data: vec![1, 2, 3] }
    );

    // Sender unknown to the helper.
    push(&mut helper, HelperInbound::data(None, b"hi")).await;
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Message { from: None, data: b"hi".to_vec() }
    );

    push(&mut helper, HelperInbound::PeerDisconnected { peer_id: PeerId::new("p1") }).await;
    assert_eq!(next_event(&mut events).await, TransportEvent::PeerDisconnected(PeerId::new("p1")));
    assert!(t.connected_peers().is_empty());

    t.destroy().await;
}

#[tokio::test]
async fn test_bad_frames_are_discarded() {
    let (addr, mut sockets) = start_helper().await;
    let t = DelegatedTransport::new(fast_config(addr));
    let mut events = t.take_events().unwrap();
    t.connect().await.unwrap();
    let mut helper = accepted(&mut sockets).await;

    helper.send(Message::text("not json")).await.unwrap();
    helper
        .send(Message::text(json!({"type": "data", "data": "***"}).to_string()))
        .await
        .unwrap();
    helper
        .send(Message::text(json!({"type": "mystery"}).to_string()))
        .await
        .unwrap();
    push(&mut helper, HelperInbound::PeerConnected { peer_id: PeerId::new("p1") }).await;

    // The link survives; the first event is the valid one.
    assert_eq!(next_event(&mut events).await, TransportEvent::PeerConnected(PeerId::new("p1")));
    assert_eq!(t.link_state(), LinkState::Connected);

    t.destroy().await;
}

#[tokio::test]
async fn test_outbound_frames_are_base64_json() {
    let (addr, mut sockets) = start_helper().await;
    let t = DelegatedTransport::new(fast_config(addr));
    let mut events = t.take_events().unwrap();
    t.connect().await.unwrap();
    let mut helper = accepted(&mut sockets).await;

    // Unknown peer: nothing goes out.
    assert!(!t.send_to(&PeerId::new("p1"), b"x"));

    push(&mut helper, HelperInbound::PeerConnected { peer_id: PeerId::new("p1") }).await;
    next_event(&mut events).await;

    assert!(t.send_to(&PeerId::new("p1"), &[0xde, 0xad]));
    let frame = pull(&mut helper).await;
    assert_eq!(frame, HelperOutbound::data(Some(PeerId::new("p1")), &[0xde, 0xad]));
    let raw: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
    assert_eq!(raw, json!({"type": "data", "peerId": "p1", "data": "3q0="}));

    t.broadcast(b"all");
    let frame = pull(&mut helper).await;
    let raw: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
    assert!(raw.get("peerId").is_none());
    assert_eq!(frame.payload().unwrap(), b"all");

    t.destroy().await;
}

#[tokio::test]
async fn test_helper_loss_disconnects_everyone_then_reconnects() {
    let (addr, mut sockets) = start_helper().await;
    let t = DelegatedTransport::new(fast_config(addr));
    let mut events = t.take_events().unwrap();
    t.connect().await.unwrap();
    let mut helper = accepted(&mut sockets).await;

    push(&mut helper, HelperInbound::Welcome { self_id: PeerId::new("me") }).await;
    for p in ["p1", "p2"] {
        push(&mut helper, HelperInbound::PeerConnected { peer_id: PeerId::new(p) }).await;
        next_event(&mut events).await;
    }

    helper.close(None).await.unwrap();
    drop(helper);

    let mut gone = vec![next_event(&mut events).await, next_event(&mut events).await];
    gone.sort_by_key(|e| format!("{e:?}"));
    assert_eq!(
        gone,
        vec![
            TransportEvent::PeerDisconnected(PeerId::new("p1")),
            TransportEvent::PeerDisconnected(PeerId::new("p2")),
        ]
    );

    // The supervisor dials again without being asked.
    let mut helper = accepted(&mut sockets).await;
    push(&mut helper, HelperInbound::Welcome { self_id: PeerId::new("me-again") }).await;
    assert_eq!(wait_for_self_id(&t).await, PeerId::new("me-again"));

    t.destroy().await;
}

#[tokio::test]
async fn test_destroy_closes_helper_socket() {
    let (addr, mut sockets) = start_helper().await;
    let t = DelegatedTransport::new(fast_config(addr));
    let mut events = t.take_events().unwrap();
    t.connect().await.unwrap();
    let mut helper = accepted(&mut sockets).await;

    push(&mut helper, HelperInbound::PeerConnected { peer_id: PeerId::new("p1") }).await;
    next_event(&mut events).await;

    t.destroy().await;
    assert_eq!(next_event(&mut events).await, TransportEvent::PeerDisconnected(PeerId::new("p1")));
    assert!(timeout(Duration::from_secs(1), events.recv()).await.unwrap().is_none());

    let closed = timeout(Duration::from_secs(2), async {
        while let Some(Ok(msg)) = helper.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert!(matches!(t.connect().await, Err(TransportError::Destroyed)));
}

#[tokio::test]
async fn test_missing_helper_exhausts_retries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = DelegatedConfig::new(format!("ws://{addr}"));
    config.reconnect = ReconnectPolicy {
        base_delay: Duration::from_millis(5),
        max_attempts: 2,
    };
    let t = DelegatedTransport::new(config);

    let result = timeout(Duration::from_secs(5), t.connect()).await.unwrap();
    assert!(matches!(result, Err(TransportError::Exhausted { attempts: 2 })));
    assert_eq!(t.link_state(), LinkState::Failed);
    assert!(!t.send_to(&PeerId::new("p1"), b"x"));
}
