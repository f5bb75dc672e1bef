//! # sluice-client
//!
//! WebSocket client for the sluice replication protocol:
//!
//! - **Connect and handshake**: version negotiation up front, structured
//!   rejection errors
//! - **Subscriptions**: per-stream handles delivering replayed history
//!   and then live events in order, without gaps or duplicates
//! - **Replay tracking**: awaitable replay completion plus a live flag
//! - **Heartbeats**: server pings are answered automatically
//!
//! A closed connection stays closed; callers own the retry policy.

#![deny(unsafe_code)]

pub mod client;
pub mod error;

pub use client::{ClientNotice, ReplicationClient, SubscriptionHandle};
pub use error::ClientError;
