//! Wire-format messages for the replication protocol.
//!
//! Two tagged unions cross the socket: [`ClientMessage`] (client → server)
//! and [`ServerMessage`] (server → client). Both serialize with a `type`
//! tag and camelCase field names; subscribers on other platforms rely on
//! the exact strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::StreamId;

/// A single event persisted in a stream's append-only log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    /// Stream the event belongs to.
    pub stream_id: StreamId,
    /// Per-stream sequence number assigned at append time (1-based).
    pub seq: i64,
    /// Opaque event payload.
    pub payload: Value,
}

impl StoredEvent {
    /// Create a new stored event.
    #[must_use]
    pub fn new(stream_id: impl Into<StreamId>, seq: i64, payload: Value) -> Self {
        Self {
            stream_id: stream_id.into(),
            seq,
            payload,
        }
    }
}

/// Machine-readable protocol error codes.
///
/// [`ErrorCode::VersionMismatch`] and [`ErrorCode::BufferOverflow`] are
/// fatal: the server closes the connection after reporting them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Frame was not valid JSON or not a recognized message.
    InvalidMessage,
    /// Client and server speak different protocol versions.
    VersionMismatch,
    /// Replay-phase holding buffer exceeded its capacity.
    BufferOverflow,
    /// The event store failed while reading history.
    ReplayFailed,
}

impl ErrorCode {
    /// Whether the server closes the connection after sending this code.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::VersionMismatch | Self::BufferOverflow)
    }

    /// The wire string for this code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::BufferOverflow => "BUFFER_OVERFLOW",
            Self::ReplayFailed => "REPLAY_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages a client sends to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Version handshake; must be the first message on every connection.
    #[serde(rename = "hello")]
    Hello {
        /// Protocol version the client speaks.
        version: u32,
    },

    /// Subscribe to a stream, optionally resuming above a known sequence.
    #[serde(rename = "subscribe")]
    Subscribe {
        /// Stream to subscribe to.
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        /// Replay only events with `seq` greater than this; absent means
        /// replay from the beginning.
        #[serde(rename = "afterSeq", skip_serializing_if = "Option::is_none")]
        after_seq: Option<i64>,
    },

    /// Drop a subscription.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        /// Stream to stop receiving.
        #[serde(rename = "streamId")]
        stream_id: StreamId,
    },

    /// Heartbeat reply.
    #[serde(rename = "pong")]
    Pong,
}

/// Messages the server sends to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Handshake acknowledgement; nothing else is sent before it.
    #[serde(rename = "server-hello")]
    ServerHello {
        /// Protocol version the server speaks.
        version: u32,
    },

    /// One event, from replay or live broadcast.
    #[serde(rename = "event")]
    Event {
        /// Stream the event belongs to.
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        /// The event itself.
        event: StoredEvent,
    },

    /// Replay finished; everything after this is live.
    #[serde(rename = "replay-end")]
    ReplayEnd {
        /// Stream whose replay completed.
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        /// Highest sequence delivered by replay (the resume point when
        /// replay found nothing newer).
        #[serde(rename = "lastReplaySeq")]
        last_replay_seq: i64,
    },

    /// Structured protocol error.
    #[serde(rename = "error")]
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },

    /// Heartbeat probe; clients answer with `pong`.
    #[serde(rename = "ping")]
    Ping,
}

impl ServerMessage {
    /// Wrap a stored event for delivery.
    #[must_use]
    pub fn event(event: StoredEvent) -> Self {
        Self::Event {
            stream_id: event.stream_id.clone(),
            event,
        }
    }

    /// Build a replay-end marker.
    #[must_use]
    pub fn replay_end(stream_id: StreamId, last_replay_seq: i64) -> Self {
        Self::ReplayEnd {
            stream_id,
            last_replay_seq,
        }
    }

    /// Build a structured error.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}
