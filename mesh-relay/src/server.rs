//! HTTP surface of the relay.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /healthz` | liveness probe |
//! | `GET /stats` | relay counters as JSON |
//! | `GET /ws/{topic}` | WebSocket upgrade into the relay protocol |

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::config::RelayConfig;
use crate::connection::serve_connection;
use crate::error::RelayError;
use crate::registry::TopicRegistry;
use crate::stats::{RelayStats, StatsSnapshot};

/// State shared by every connection task.
pub struct RelayContext {
    pub config: RelayConfig,
    pub registry: TopicRegistry,
    pub stats: RelayStats,
}

/// The rendezvous/relay server.
pub struct RelayServer {
    ctx: Arc<RelayContext>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = TopicRegistry::new(config.shard_count);
        Self {
            ctx: Arc::new(RelayContext {
                config,
                registry,
                stats: RelayStats::default(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Build the axum router for this server.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/stats", get(stats))
            .route("/ws/{topic}", get(upgrade))
            .with_state(self.ctx.clone())
    }

    /// Bind to the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        log::info!("Relay listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        log::info!("Relay stopped");
        Ok(())
    }

    pub async fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot(self.ctx.registry.topic_count().await)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.ctx.registry
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn stats(State(ctx): State<Arc<RelayContext>>) -> Json<StatsSnapshot> {
    Json(ctx.stats.snapshot(ctx.registry.topic_count().await))
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Path(topic): Path<String>,
    State(ctx): State<Arc<RelayContext>>,
) -> impl IntoResponse {
    log::debug!("Upgrading connection for topic {topic}");
    ws.on_upgrade(move |socket| serve_connection(socket, topic, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.config().bind_addr, "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats, StatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = RelayServer::with_defaults();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
        });
        tx.send(()).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
