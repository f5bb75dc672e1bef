//! WebSocket connection management: registry fan-out, per-connection
//! session loops, subscription state, and heartbeat liveness.

pub mod connection;
pub mod heartbeat;
pub mod registry;
pub mod session;
pub mod subscription;
