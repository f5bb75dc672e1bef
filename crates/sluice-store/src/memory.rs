//! In-memory event store for tests and ephemeral runs.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use sluice_proto::{StoredEvent, StreamId};

use crate::errors::Result;
use crate::store::EventStore;

/// `HashMap`-backed [`EventStore`].
///
/// Sequence numbers are dense per stream (position + 1), so replay is a
/// slice copy. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryEventStore {
    streams: RwLock<HashMap<StreamId, Vec<StoredEvent>>>,
}

impl MemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events held for a stream.
    #[must_use]
    pub fn len(&self, stream_id: &StreamId) -> usize {
        self.streams.read().get(stream_id).map_or(0, Vec::len)
    }

    /// Whether the stream holds no events.
    #[must_use]
    pub fn is_empty(&self, stream_id: &StreamId) -> bool {
        self.len(stream_id) == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, stream_id: &StreamId, payload: Value) -> Result<StoredEvent> {
        let mut streams = self.streams.write();
        let log = streams.entry(stream_id.clone()).or_default();
        #[allow(clippy::cast_possible_wrap)]
        let seq = log.len() as i64 + 1;
        let event = StoredEvent::new(stream_id.clone(), seq, payload);
        log.push(event.clone());
        Ok(event)
    }

    async fn replay(&self, stream_id: &StreamId, after_seq: i64) -> Result<Vec<StoredEvent>> {
        let streams = self.streams.read();
        let Some(log) = streams.get(stream_id) else {
            return Ok(Vec::new());
        };
        // Seqs are dense, so the resume point is just an offset.
        let start = usize::try_from(after_seq.max(0)).unwrap_or(usize::MAX);
        Ok(log.get(start..).unwrap_or_default().to_vec())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sid(s: &str) -> StreamId {
        StreamId::from(s)
    }

    #[tokio::test]
    async fn append_assigns_dense_sequences() {
        let store = MemoryEventStore::new();
        for i in 1..=3 {
            let event = store.append(&sid("s1"), json!({"n": i})).await.unwrap();
            assert_eq!(event.seq, i);
        }
        assert_eq!(store.len(&sid("s1")), 3);
    }

    #[tokio::test]
    async fn replay_from_beginning() {
        let store = MemoryEventStore::new();
        for i in 1..=5 {
            let _ = store.append(&sid("s1"), json!({"n": i})).await.unwrap();
        }
        let events = store.replay(&sid("s1"), 0).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn replay_above_resume_point() {
        let store = MemoryEventStore::new();
        for i in 1..=10 {
            let _ = store.append(&sid("s1"), json!({"n": i})).await.unwrap();
        }
        let events = store.replay(&sid("s1"), 5).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![6, 7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn replay_past_the_end_is_empty() {
        let store = MemoryEventStore::new();
        let _ = store.append(&sid("s1"), json!(1)).await.unwrap();
        assert!(store.replay(&sid("s1"), 99).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_unknown_stream_is_empty() {
        let store = MemoryEventStore::new();
        assert!(store.replay(&sid("ghost"), 0).await.unwrap().is_empty());
        assert!(store.is_empty(&sid("ghost")));
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let store = MemoryEventStore::new();
        let a = store.append(&sid("a"), json!("a1")).await.unwrap();
        let b = store.append(&sid("b"), json!("b1")).await.unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 1);
        assert_eq!(store.replay(&sid("a"), 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn payload_survives_roundtrip() {
        let store = MemoryEventStore::new();
        let payload = json!({"kind": "order.created", "total": 12.5});
        let _ = store.append(&sid("s1"), payload.clone()).await.unwrap();
        let events = store.replay(&sid("s1"), 0).await.unwrap();
        assert_eq!(events[0].payload, payload);
        assert_eq!(events[0].stream_id.as_str(), "s1");
    }
}
