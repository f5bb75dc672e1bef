//! Connection registry and committed-event fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use sluice_proto::{ConnectionId, StoredEvent};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::WS_DELIVERY_DROPS_TOTAL;

use super::connection::{ConnCommand, ConnectionHandle};

/// Capacity of each connection's command channel.
const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Tracks connected clients and fans committed events out to them.
///
/// Each registered connection gets a child of the registry's shutdown
/// token, so cancelling the root tears down every session loop.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
    shutdown: CancellationToken,
}

impl ConnectionRegistry {
    /// Create an empty registry under the given shutdown token.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { connections: RwLock::new(HashMap::new()), shutdown }
    }

    /// Create and track a new connection, returning its handle and the
    /// receiving end of its command channel.
    pub async fn register(&self) -> (Arc<ConnectionHandle>, mpsc::Receiver<ConnCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let handle = Arc::new(ConnectionHandle::new(
            ConnectionId::new(),
            cmd_tx,
            self.shutdown.child_token(),
        ));
        debug!(connection_id = %handle.id, "connection registered");
        let mut connections = self.connections.write().await;
        let _ = connections.insert(handle.id.clone(), Arc::clone(&handle));
        drop(connections);
        (handle, cmd_rx)
    }

    /// Remove a connection by ID. Unknown IDs are a no-op.
    pub async fn remove(&self, connection_id: &ConnectionId) {
        let mut connections = self.connections.write().await;
        if connections.remove(connection_id).is_some() {
            debug!(connection_id = %connection_id, "connection removed");
        }
    }

    /// Number of tracked connections.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Fan a committed event out to every connection.
    ///
    /// Each session loop decides whether the event matches one of its
    /// subscriptions; the registry only routes. Connections that cannot
    /// accept the command are counted as delivery drops.
    pub async fn deliver(&self, event: &Arc<StoredEvent>) {
        let connections = self.connections.read().await;
        debug!(
            stream_id = %event.stream_id,
            seq = event.seq,
            recipients = connections.len(),
            "fanning out event"
        );
        for connection in connections.values() {
            if !connection.deliver(Arc::clone(event)) {
                counter!(WS_DELIVERY_DROPS_TOTAL).increment(1);
            }
        }
    }
}
