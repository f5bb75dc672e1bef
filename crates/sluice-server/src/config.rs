//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the replication server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server-initiated protocol pings, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// How long to wait for a pong before force-closing, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Maximum events buffered per subscription while its replay runs.
    pub max_buffer_size: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl ReplicationConfig {
    /// Heartbeat ping interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Pong deadline as a `Duration`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 50,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 10_000,
            max_buffer_size: 1000,
            max_message_size: 1024 * 1024, // 1 MiB
        }
    }
}
