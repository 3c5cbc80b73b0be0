//! mesh relay — rendezvous and negotiation relay node.
//!
//! Usage:
//!   mesh-relay --bind 0.0.0.0:9090
//!
//! The relay keeps no state beyond live connections.

use std::time::Duration;

use clap::Parser;
use mesh_relay::{RelayConfig, RelayServer};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "mesh-relay")]
#[command(about = "Rendezvous and negotiation relay for mesh peers")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Outbound queue capacity per connection
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,

    /// Milliseconds to wait for room in a full queue before dropping (0 = never wait)
    #[arg(long, default_value_t = 0)]
    enqueue_timeout_ms: u64,

    /// Seconds between liveness pings
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), mesh_relay::RelayError> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = RelayConfig {
        bind_addr: args.bind,
        queue_capacity: args.queue_capacity,
        enqueue_timeout: Duration::from_millis(args.enqueue_timeout_ms),
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs.max(1)),
        ..RelayConfig::default()
    };

    let listener = TcpListener::bind(&config.bind_addr).await?;
    let server = RelayServer::new(config);
    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            log::info!("Shutdown requested");
        })
        .await
}
