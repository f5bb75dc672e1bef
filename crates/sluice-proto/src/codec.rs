//! Encoding and decoding of wire frames.
//!
//! Decoding never fails loudly: a frame that does not parse as the
//! expected message type yields `None`, and the connection manager decides
//! what to do about it (usually an `INVALID_MESSAGE` error). Encoding of
//! protocol messages cannot fail for well-formed payloads.

use serde::Serialize;
use tracing::{debug, error};

use crate::messages::{ClientMessage, ServerMessage};

/// Protocol version spoken by this build.
///
/// Negotiated once per connection during the hello handshake; the codec
/// itself accepts any well-formed frame regardless of version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Serialize a protocol message to its JSON wire form.
pub fn encode_message<M: Serialize>(message: &M) -> String {
    serde_json::to_string(message).unwrap_or_else(|e| {
        error!(error = %e, "failed to serialize protocol message");
        String::new()
    })
}

/// Decode a client → server frame, or `None` if it is malformed.
#[must_use]
pub fn decode_client_message(raw: &str) -> Option<ClientMessage> {
    match serde_json::from_str(raw) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!(error = %e, "discarding undecodable client frame");
            None
        }
    }
}

/// Decode a server → client frame, or `None` if it is malformed.
#[must_use]
pub fn decode_server_message(raw: &str) -> Option<ServerMessage> {
    match serde_json::from_str(raw) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!(error = %e, "discarding undecodable server frame");
            None
        }
    }
}
