//! # sluice-proto
//!
//! Wire-format vocabulary and codec for the sluice replication protocol.
//!
//! Everything that crosses the socket is defined here:
//!
//! - **Branded IDs**: `StreamId` (caller-chosen stream names) and
//!   `ConnectionId` (server-assigned, UUID v7) as newtypes for type safety
//! - **Messages**: `ClientMessage` / `ServerMessage` tagged unions matching
//!   the camelCase JSON wire format exactly
//! - **Events**: `StoredEvent` with stream, sequence number, and opaque payload
//! - **Errors**: closed `ErrorCode` taxonomy with a fatal/non-fatal split
//! - **Codec**: `encode_message`, `decode_client_message`,
//!   `decode_server_message`, and the negotiated `PROTOCOL_VERSION`

#![deny(unsafe_code)]

pub mod codec;
pub mod ids;
pub mod messages;

pub use codec::{
    PROTOCOL_VERSION, decode_client_message, decode_server_message, encode_message,
};
pub use ids::{ConnectionId, StreamId};
pub use messages::{ClientMessage, ErrorCode, ServerMessage, StoredEvent};
