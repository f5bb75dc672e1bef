//! Client-side error types.

use sluice_proto::ErrorCode;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors surfaced by [`crate::ReplicationClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level WebSocket failure.
    #[error("websocket transport: {0}")]
    Transport(#[from] tungstenite::Error),

    /// The server refused the connection during the handshake.
    #[error("server rejected connection: {code}: {message}")]
    Rejected {
        /// Machine-readable rejection code.
        code: ErrorCode,
        /// Human-readable explanation.
        message: String,
    },

    /// The peer sent something the protocol does not allow here.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No handshake reply arrived in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The connection is closed.
    #[error("connection closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_display_includes_code_and_message() {
        let err = ClientError::Rejected {
            code: ErrorCode::VersionMismatch,
            message: "server speaks v1".into(),
        };
        let text = err.to_string();
        assert!(text.contains("VERSION_MISMATCH"));
        assert!(text.contains("server speaks v1"));
    }

    #[test]
    fn protocol_display_includes_detail() {
        let err = ClientError::Protocol("unexpected frame".into());
        assert!(err.to_string().contains("unexpected frame"));
    }

    #[test]
    fn transport_wraps_tungstenite() {
        let err = ClientError::from(tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, ClientError::Transport(_)));
    }
}
