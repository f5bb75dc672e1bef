//! `SQLite` backend for the event store.
//!
//! A pooled `rusqlite` connection in WAL mode behind the async
//! [`EventStore`] trait. The sync core is two stateless functions taking
//! `&Connection`; the async surface hops onto the blocking thread pool via
//! [`tokio::task::spawn_blocking`].
//!
//! - **[`connection`]**: `r2d2` pool with WAL mode and busy timeout applied
//!   to every connection.
//! - **[`migrations`]**: Version-tracked schema evolution, embedded at
//!   compile time and run transactionally.

pub mod connection;
pub mod migrations;

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{Connection, TransactionBehavior, params};
use serde_json::Value;
use sluice_proto::{StoredEvent, StreamId};

use crate::errors::{Result, StoreError};
use crate::store::EventStore;

pub use connection::{ConnectionConfig, ConnectionPool, PooledConnection, new_file};
pub use migrations::{current_version, latest_version, run_migrations};

/// Durable [`EventStore`] over a pooled `SQLite` database.
pub struct SqliteEventStore {
    pool: ConnectionPool,
}

impl SqliteEventStore {
    /// Open (or create) a database file and run pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &ConnectionConfig::default())
    }

    /// Open with explicit pool configuration.
    pub fn open_with(path: impl AsRef<Path>, config: &ConnectionConfig) -> Result<Self> {
        let pool = new_file(path.as_ref(), config)?;
        let conn = pool.get()?;
        let _ = run_migrations(&conn)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(&self, stream_id: &StreamId, payload: Value) -> Result<StoredEvent> {
        let pool = self.pool.clone();
        let stream_id = stream_id.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            insert_event(&mut conn, &stream_id, &payload)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("append task failed: {e}")))?
    }

    async fn replay(&self, stream_id: &StreamId, after_seq: i64) -> Result<Vec<StoredEvent>> {
        let pool = self.pool.clone();
        let stream_id = stream_id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            select_after(&conn, &stream_id, after_seq)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("replay task failed: {e}")))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sync core: every function takes a connection and executes SQL
// ─────────────────────────────────────────────────────────────────────────────

fn insert_event(conn: &mut Connection, stream_id: &StreamId, payload: &Value) -> Result<StoredEvent> {
    let payload_str = serde_json::to_string(payload)?;
    // Immediate transaction: concurrent appenders queue on the write lock
    // instead of racing the MAX(seq) read.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE stream_id = ?1",
        params![stream_id.as_str()],
        |row| row.get(0),
    )?;
    let _ = tx.execute(
        "INSERT INTO events (stream_id, seq, payload) VALUES (?1, ?2, ?3)",
        params![stream_id.as_str(), seq, payload_str],
    )?;
    tx.commit()?;
    Ok(StoredEvent::new(stream_id.clone(), seq, payload.clone()))
}

fn select_after(conn: &Connection, stream_id: &StreamId, after_seq: i64) -> Result<Vec<StoredEvent>> {
    let mut stmt = conn.prepare(
        "SELECT seq, payload FROM events WHERE stream_id = ?1 AND seq > ?2 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![stream_id.as_str(), after_seq], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (seq, payload_str) = row?;
        let payload: Value = serde_json::from_str(&payload_str)?;
        events.push(StoredEvent::new(stream_id.clone(), seq, payload));
    }
    Ok(events)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn sid(s: &str) -> StreamId {
        StreamId::from(s)
    }

    fn open_temp() -> (tempfile::TempDir, SqliteEventStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().join("events.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn append_then_replay_roundtrip() {
        let (_dir, store) = open_temp();
        let payload = json!({"kind": "order.created", "total": 12.5});
        let event = store.append(&sid("s1"), payload.clone()).await.unwrap();
        assert_eq!(event.seq, 1);

        let events = store.replay(&sid("s1"), 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, payload);
        assert_eq!(events[0].stream_id.as_str(), "s1");
    }

    #[tokio::test]
    async fn sequences_are_dense_per_stream() {
        let (_dir, store) = open_temp();
        for i in 1..=5 {
            let event = store.append(&sid("s1"), json!({"n": i})).await.unwrap();
            assert_eq!(event.seq, i);
        }
        let other = store.append(&sid("s2"), json!({})).await.unwrap();
        assert_eq!(other.seq, 1);
    }

    #[tokio::test]
    async fn replay_filters_at_resume_point() {
        let (_dir, store) = open_temp();
        for i in 1..=10 {
            let _ = store.append(&sid("s1"), json!({"n": i})).await.unwrap();
        }
        let events = store.replay(&sid("s1"), 5).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![6, 7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn replay_unknown_stream_is_empty() {
        let (_dir, store) = open_temp();
        assert!(store.replay(&sid("ghost"), 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");

        {
            let store = SqliteEventStore::open(&path).unwrap();
            let _ = store.append(&sid("s1"), json!({"n": 1})).await.unwrap();
            let _ = store.append(&sid("s1"), json!({"n": 2})).await.unwrap();
        }

        let store = SqliteEventStore::open(&path).unwrap();
        let events = store.replay(&sid("s1"), 0).await.unwrap();
        assert_eq!(events.len(), 2);

        // The sequence continues where it left off.
        let next = store.append(&sid("s1"), json!({"n": 3})).await.unwrap();
        assert_eq!(next.seq, 3);
    }

    #[tokio::test]
    async fn concurrent_appends_get_unique_sequences() {
        let (_dir, store) = open_temp();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.append(&sid("s1"), json!({"n": i})).await.unwrap().seq
            }));
        }

        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=16).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn open_with_custom_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConnectionConfig {
            pool_size: 2,
            ..Default::default()
        };
        let store = SqliteEventStore::open_with(dir.path().join("t.db"), &config).unwrap();
        let event = store.append(&sid("s1"), json!(null)).await.unwrap();
        assert_eq!(event.seq, 1);
    }
}
