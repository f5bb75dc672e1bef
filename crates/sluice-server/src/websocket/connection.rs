//! Per-connection command channel and the handle the registry fans
//! events out through.

use std::sync::Arc;

use sluice_proto::{ConnectionId, StoredEvent, StreamId};
use sluice_store::StoreError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Result of a completed replay read, ready to stream to the client.
#[derive(Debug)]
pub struct ReplayBatch {
    /// Events above the resume point, in ascending sequence order.
    pub events: Vec<StoredEvent>,
    /// Highest sequence in `events`, or the resume point when empty.
    pub last_replay_seq: i64,
}

/// Commands consumed by a connection's session loop.
///
/// The session loop is the only code that touches subscription state;
/// broadcast fan-out and replay tasks communicate with it through these.
#[derive(Debug)]
pub enum ConnCommand {
    /// A freshly committed event to route through matching subscriptions.
    Deliver {
        /// The committed event.
        event: Arc<StoredEvent>,
    },
    /// A spawned replay read finished.
    ReplayLoaded {
        /// Stream the replay was for.
        stream_id: StreamId,
        /// Subscription generation the replay was started under.
        generation: u64,
        /// Loaded events, or the store failure.
        result: Result<ReplayBatch, StoreError>,
    },
}

/// Registry-side handle to a connected client.
pub struct ConnectionHandle {
    /// Unique connection ID.
    pub id: ConnectionId,
    cmd_tx: mpsc::Sender<ConnCommand>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Create a new handle around a connection's command channel.
    pub fn new(
        id: ConnectionId,
        cmd_tx: mpsc::Sender<ConnCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self { id, cmd_tx, cancel }
    }

    /// Enqueue an event for this connection without blocking.
    ///
    /// Returns `false` if the command queue is full or closed. A full
    /// queue also cancels the connection: its session loop has stopped
    /// draining the channel.
    pub fn deliver(&self, event: Arc<StoredEvent>) -> bool {
        match self.cmd_tx.try_send(ConnCommand::Deliver { event }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection_id = %self.id,
                    "command queue full, cancelling slow connection"
                );
                self.cancel.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Sender for the connection's command channel, used by replay tasks
    /// to report back.
    pub fn command_sender(&self) -> mpsc::Sender<ConnCommand> {
        self.cmd_tx.clone()
    }

    /// The connection's cancellation token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
