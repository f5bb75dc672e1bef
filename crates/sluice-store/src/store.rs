//! The event store contract the replication server is written against.

use async_trait::async_trait;
use serde_json::Value;
use sluice_proto::{StoredEvent, StreamId};

use crate::errors::Result;

/// Append-only, per-stream event log.
///
/// Sequence numbers start at 1 and are assigned by the store at append
/// time, strictly increasing and dense within a stream. `replay` is the
/// contract subscriptions are built on: everything committed above the
/// resume point, in ascending order, with no gaps. Events committed
/// *after* the read started may or may not be included; the replication
/// layer deduplicates at the boundary.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a payload to a stream, assigning the next sequence number.
    ///
    /// A stream springs into existence on its first append.
    async fn append(&self, stream_id: &StreamId, payload: Value) -> Result<StoredEvent>;

    /// Read all committed events with `seq > after_seq`, ascending.
    ///
    /// `after_seq = 0` replays the stream from its beginning. An unknown
    /// stream replays empty; subscribing before the first append is legal.
    async fn replay(&self, stream_id: &StreamId, after_seq: i64) -> Result<Vec<StoredEvent>>;
}
