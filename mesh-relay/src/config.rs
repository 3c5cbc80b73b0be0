//! Relay configuration.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Per-connection outbound queue capacity
    pub queue_capacity: usize,
    /// How long a relay may wait for room in a target's queue.
    /// Zero means never wait: a full queue drops immediately.
    pub enqueue_timeout: Duration,
    /// Interval between liveness pings
    pub heartbeat_interval: Duration,
    /// Number of topic registry shards
    pub shard_count: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            queue_capacity: 256,
            enqueue_timeout: Duration::ZERO,
            heartbeat_interval: Duration::from_secs(30),
            shard_count: 16,
        }
    }
}
