//! HTTP/WebSocket server assembly and the publish path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use sluice_proto::{StoredEvent, StreamId};
use sluice_store::{EventStore, StoreError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ReplicationConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::EVENTS_BROADCAST_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::run_connection;

/// Shared state visible to axum handlers and session loops.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ReplicationConfig>,
    /// Event store subscriptions replay from.
    pub store: Arc<dyn EventStore>,
    /// Connection registry for event fan-out.
    pub registry: Arc<ConnectionRegistry>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started, for `/health` uptime.
    pub start_time: Instant,
    /// Subscriptions currently in live delivery, for `/health`.
    pub streams_live: Arc<AtomicUsize>,
    /// Renders the `/metrics` endpoint.
    pub metrics: PrometheusHandle,
}

/// Handle to a started server.
pub struct ServerHandle {
    /// Bound address; reflects the real port when configured with port 0.
    pub addr: SocketAddr,
    server: JoinHandle<()>,
}

/// The replication server: an axum app serving `/ws`, `/health`, and
/// `/metrics`, plus the publish path that appends events and fans them
/// out to subscribers.
pub struct ReplicationServer {
    config: Arc<ReplicationConfig>,
    store: Arc<dyn EventStore>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    streams_live: Arc<AtomicUsize>,
    metrics: PrometheusHandle,
    publish_locks: Mutex<HashMap<StreamId, Arc<Mutex<()>>>>,
}

impl ReplicationServer {
    /// Create a server over the given store.
    pub fn new(
        config: ReplicationConfig,
        store: Arc<dyn EventStore>,
        metrics: PrometheusHandle,
    ) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let registry = Arc::new(ConnectionRegistry::new(shutdown.token()));
        Self {
            config: Arc::new(config),
            store,
            registry,
            shutdown,
            start_time: Instant::now(),
            streams_live: Arc::new(AtomicUsize::new(0)),
            metrics,
            publish_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Build the axum router with all routes and shared state.
    pub fn router(&self) -> Router {
        let state = AppState {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            streams_live: Arc::clone(&self.streams_live),
            metrics: self.metrics.clone(),
        };
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    /// Bind the listener and serve in a background task.
    ///
    /// Returns once the listener is ready, so the handle's `addr` is
    /// immediately connectable. The task drains on shutdown: the accept
    /// loop stops and upgraded connections get to finish.
    pub async fn start(&self) -> std::io::Result<ServerHandle> {
        let router = self.router();
        let bind_addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        let addr = listener.local_addr()?;
        info!(addr = %addr, "replication server listening");

        let cancel = self.shutdown.token();
        let server = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel.cancelled().await });
            if let Err(error) = serve.await {
                error!(error = %error, "server task failed");
            }
        });

        Ok(ServerHandle { addr, server })
    }

    /// Signal shutdown and wait for the server task to drain.
    pub async fn stop(&self, handle: ServerHandle, timeout: Option<Duration>) {
        self.shutdown.graceful_shutdown(vec![handle.server], timeout).await;
    }

    /// Append payloads to a stream and fan each committed event out to
    /// connected subscribers.
    ///
    /// Appends to the same stream are serialized so fan-out order matches
    /// commit order; different streams publish concurrently.
    pub async fn publish(
        &self,
        stream_id: &StreamId,
        payloads: Vec<Value>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let stream_lock = {
            let mut locks = self.publish_locks.lock().await;
            Arc::clone(locks.entry(stream_id.clone()).or_default())
        };
        let _guard = stream_lock.lock().await;

        let mut committed = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let event = self.store.append(stream_id, payload).await?;
            counter!(EVENTS_BROADCAST_TOTAL).increment(1);
            self.registry.deliver(&Arc::new(event.clone())).await;
            committed.push(event);
        }
        Ok(committed)
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The server configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }
}

/// GET /ws: upgrade to the replication protocol.
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if state.registry.count().await >= state.config.max_connections {
        warn!(
            max_connections = state.config.max_connections,
            "connection limit reached, rejecting upgrade"
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let max_message_size = state.config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Register the connection and run its session to completion.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (handle, cmd_rx) = state.registry.register().await;
    run_connection(socket, handle, cmd_rx, state).await;
}

/// GET /health: liveness plus connection and stream counters.
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.registry.count().await;
    let streams_live = state.streams_live.load(Ordering::Relaxed);
    Json(health::health_check(state.start_time, connections, streams_live))
}

/// GET /metrics: Prometheus exposition text.
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}
