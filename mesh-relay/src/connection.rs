//! Per-connection task.
//!
//! One task per accepted socket. It is the only writer to that socket: frames
//! produced anywhere else arrive through the connection's bounded queue and
//! are written here, so frames never interleave on the wire.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use mesh_core::{ErrorCode, PeerId, Relayed, ServerMessage};
use tokio::sync::mpsc;

use crate::envelope::{parse_envelope, Rejection};
use crate::registry::{frame, Frame, PeerHandle, Topic};
use crate::server::RelayContext;

/// Drive a single upgraded socket until it closes.
pub async fn serve_connection(socket: WebSocket, topic_name: String, ctx: Arc<RelayContext>) {
    let self_id = PeerId::generate();
    let (tx, mut rx) = mpsc::channel::<Frame>(ctx.config.queue_capacity.max(2));
    let handle = PeerHandle::new(self_id.clone(), tx);

    ctx.stats.connection_opened();
    let (topic, _existing) = ctx.registry.join(&topic_name, handle.clone()).await;

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(ctx.config.heartbeat_interval);
    heartbeat.tick().await;
    let mut alive = true;

    loop {
        tokio::select! {
            // Outbound queue → socket
            queued = rx.recv() => {
                let Some(text) = queued else { break };
                if let Err(e) = sink.send(Message::Text(text.as_ref().into())).await {
                    log::debug!("Write to {self_id} failed: {e}");
                    break;
                }
            }

            // Socket → relay
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        alive = true;
                        relay_envelope(&ctx, &topic, &handle, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        alive = true;
                        reject(&ctx, &handle, Rejection {
                            code: ErrorCode::InvalidType,
                            message: "binary frames are not supported".into(),
                            correlation_id: None,
                        });
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        alive = true;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Peer {self_id} closed its connection");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {self_id}: {e}");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if !alive {
                    log::warn!("Peer {self_id} missed a heartbeat, closing");
                    break;
                }
                alive = false;
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    ctx.registry.leave(&topic, &self_id).await;
    ctx.stats.connection_closed();
    log::info!("Peer {self_id} left topic {}", topic.name());
}

/// Validate one client envelope and forward it to its target.
async fn relay_envelope(ctx: &RelayContext, topic: &Topic, sender: &PeerHandle, text: &str) {
    let envelope = match parse_envelope(text) {
        Ok(envelope) => envelope,
        Err(rejection) => {
            reject(ctx, sender, rejection);
            return;
        }
    };

    let Some(target) = topic.member(&envelope.to).await else {
        reject(ctx, sender, Rejection {
            code: ErrorCode::TargetNotFound,
            message: format!("no peer {} in topic {}", envelope.to, topic.name()),
            correlation_id: envelope.correlation_id,
        });
        return;
    };

    let relayed = ServerMessage::relayed(
        envelope.kind,
        Relayed {
            from: sender.id().clone(),
            payload: envelope.payload,
            correlation_id: envelope.correlation_id.clone(),
        },
    );
    let Some(f) = frame(&relayed) else { return };

    match target.enqueue(f, ctx.config.enqueue_timeout).await {
        Ok(()) => {
            ctx.stats.relayed();
            log::debug!("Relayed {} {} → {}", envelope.kind.as_str(), sender.id(), envelope.to);
        }
        Err(e) => {
            ctx.stats.dropped();
            log::warn!("Dropped {} from {} to {}: {e}", envelope.kind.as_str(), sender.id(), envelope.to);
            reply(sender, ServerMessage::error(
                ErrorCode::Dropped,
                format!("{} to {} dropped: {e}", envelope.kind.as_str(), envelope.to),
                envelope.correlation_id,
            ));
        }
    }
}

fn reject(ctx: &RelayContext, sender: &PeerHandle, rejection: Rejection) {
    ctx.stats.protocol_error();
    log::debug!("Rejected frame from {}: {:?} {}", sender.id(), rejection.code, rejection.message);
    reply(sender, ServerMessage::error(rejection.code, rejection.message, rejection.correlation_id));
}

/// Queue a reply on the sender's own queue. Best-effort.
fn reply(sender: &PeerHandle, msg: ServerMessage) {
    if let Some(f) = frame(&msg) {
        if let Err(e) = sender.try_enqueue(f) {
            log::warn!("Could not queue reply for {}: {e}", sender.id());
        }
    }
}
