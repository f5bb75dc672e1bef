//! # sluice-store
//!
//! Event store contract and backends for the sluice replication server.
//!
//! - **[`EventStore`]**: the async trait the server replays from and appends
//!   through, with strictly increasing per-stream sequence numbers and
//!   gap-free ascending replay
//! - **[`SqliteEventStore`]**: durable backend over a pooled `rusqlite`
//!   connection with WAL mode and version-tracked migrations
//! - **[`MemoryEventStore`]**: `HashMap`-backed backend for tests and
//!   ephemeral runs

#![deny(unsafe_code)]

pub mod errors;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use errors::{Result, StoreError};
pub use memory::MemoryEventStore;
pub use sqlite::SqliteEventStore;
pub use store::EventStore;
