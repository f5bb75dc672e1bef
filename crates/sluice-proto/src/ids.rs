//! Branded ID newtypes for type safety.
//!
//! Stream and connection identifiers are distinct newtype wrappers around
//! `String`, so a connection ID can never be passed where a stream ID is
//! expected. Both serialize transparently as plain JSON strings.
//!
//! `StreamId` values are chosen by producers (any non-empty string names a
//! stream); `ConnectionId` values are assigned by the server as UUID v7
//! (time-ordered) via [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of an append-only event stream.
///
/// Stream names are opaque to the protocol; producers pick them and
/// subscribers echo them back.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume self and return the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::ops::Deref for StreamId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

/// Identifier of one physical client connection.
///
/// Assigned server-side when the socket is accepted and used as the
/// registry key for the connection's whole lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a new random ID (UUID v7, time-ordered).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_new_is_uuid_v7() {
        let id = ConnectionId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn stream_id_from_str_ref() {
        let id = StreamId::from("orders-eu");
        assert_eq!(id.as_str(), "orders-eu");
    }

    #[test]
    fn stream_id_deref_to_str() {
        let id = StreamId::from("s1");
        let s: &str = &id;
        assert_eq!(s, "s1");
    }

    #[test]
    fn stream_id_display() {
        let id = StreamId::from("display-me");
        assert_eq!(format!("{id}"), "display-me");
    }

    #[test]
    fn stream_id_into_string() {
        let id = StreamId::from("convert");
        let s: String = id.into();
        assert_eq!(s, "convert");
    }

    #[test]
    fn stream_id_serde_roundtrip() {
        let id = StreamId::from("serde-test");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"serde-test\"");
        let back: StreamId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ids_serde_in_struct() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Envelope {
            stream_id: StreamId,
            connection_id: ConnectionId,
        }

        let env = Envelope {
            stream_id: StreamId::from("s1"),
            connection_id: ConnectionId::from("conn-1"),
        };
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn stream_id_hash_and_eq() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        let id = StreamId::from("same");
        let _ = set.insert(id.clone());
        let _ = set.insert(id);
        assert_eq!(set.len(), 1);
    }
}
