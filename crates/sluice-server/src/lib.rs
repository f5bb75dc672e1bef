//! # sluice-server
//!
//! Axum HTTP + `WebSocket` server for event stream replication.
//!
//! - `/ws` endpoint: version handshake, per-stream subscriptions,
//!   replay-then-live delivery with bounded buffering
//! - Per-connection command loop owning all subscription state
//!   (`tokio::select!` over socket, command channel, heartbeat)
//! - Connection registry fan-out for committed events via
//!   [`ReplicationServer::publish`]
//! - Heartbeat ping/pong liveness with forced disconnect on timeout
//! - `/health` and Prometheus `/metrics` endpoints
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ReplicationConfig;
pub use server::{AppState, ReplicationServer, ServerHandle};
pub use shutdown::ShutdownCoordinator;
