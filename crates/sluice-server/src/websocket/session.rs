//! Per-connection session loop.
//!
//! Everything a connection does funnels through one `select` loop: frames
//! from the socket, commands from the registry and replay tasks, the ping
//! interval, and the pong deadline. Subscription state is plain local
//! data because no other task can reach it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use sluice_proto::{
    ClientMessage, ErrorCode, PROTOCOL_VERSION, ServerMessage, StreamId, decode_client_message,
    encode_message,
};
use sluice_store::EventStore;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::metrics::{
    BUFFER_OVERFLOWS_TOTAL, EVENTS_DELIVERED_TOTAL, HEARTBEAT_TIMEOUTS_TOTAL,
    REPLAY_DURATION_SECONDS, REPLAY_FAILURES_TOTAL, REPLAYS_TOTAL, STREAMS_LIVE,
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::server::AppState;

use super::connection::{ConnCommand, ConnectionHandle, ReplayBatch};
use super::heartbeat::{HeartbeatState, pong_deadline};
use super::subscription::{LiveAction, Subscription};

/// Capacity of the outbound frame queue feeding the writer task.
const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// How long the writer gets to flush queued frames after the loop exits.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// The peer closed the socket or the transport dropped.
    PeerGone,
    /// Handshake failed on protocol version.
    VersionMismatch,
    /// A replay buffer exceeded its bound.
    BufferOverflow,
    /// The pong deadline expired.
    HeartbeatTimeout,
    /// The server shut down or cancelled the connection.
    Cancelled,
}

/// Run a client session to completion.
///
/// Splits the socket, spawns a writer task that owns the sink, drives the
/// session loop, then unregisters and lets the writer flush before the
/// close frame goes out.
#[instrument(skip_all, fields(connection_id = %handle.id))]
pub async fn run_connection(
    socket: WebSocket,
    handle: Arc<ConnectionHandle>,
    cmd_rx: mpsc::Receiver<ConnCommand>,
    state: AppState,
) {
    let (mut ws_tx, ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);

    let connection_start = std::time::Instant::now();
    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    // Writer task: owns the sink. Frames queued before `out_tx` drops are
    // flushed before the close frame, so a fatal error queued last still
    // reaches the client.
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let reason = drive(ws_rx, cmd_rx, &handle, &out_tx, &state).await;

    info!(reason = ?reason, "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());
    if reason == CloseReason::HeartbeatTimeout {
        counter!(HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
    }

    state.registry.remove(&handle.id).await;

    drop(out_tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        warn!("writer did not flush in time, aborting");
        writer.abort();
    }
}

/// The session loop proper. Returns why the connection ended.
#[allow(clippy::too_many_lines)]
async fn drive(
    mut ws_rx: SplitStream<WebSocket>,
    mut cmd_rx: mpsc::Receiver<ConnCommand>,
    handle: &Arc<ConnectionHandle>,
    out_tx: &mpsc::Sender<String>,
    state: &AppState,
) -> CloseReason {
    let cancel = handle.cancel_token();
    let max_buffer = state.config.max_buffer_size;

    let mut handshake_complete = false;
    let mut heartbeat = HeartbeatState::Idle;
    let mut subscriptions: HashMap<StreamId, Subscription> = HashMap::new();
    let mut next_generation: u64 = 0;

    let mut ping_interval = tokio::time::interval(state.config.heartbeat_interval());
    // The first tick fires immediately; skip it so pings start one
    // interval in.
    let _ = ping_interval.tick().await;

    let reason = 'session: loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let Some(Ok(frame)) = frame else {
                    break 'session CloseReason::PeerGone;
                };
                let text = match frame {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        debug!("rejecting binary frame");
                        let error = ServerMessage::error(
                            ErrorCode::InvalidMessage,
                            "binary frames are not supported",
                        );
                        if !queue(out_tx, &cancel, &error).await {
                            break 'session CloseReason::PeerGone;
                        }
                        continue;
                    }
                    Message::Close(_) => {
                        debug!("client sent close frame");
                        break 'session CloseReason::PeerGone;
                    }
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                let Some(message) = decode_client_message(text.as_str()) else {
                    let error = ServerMessage::error(
                        ErrorCode::InvalidMessage,
                        "frame is not a recognized protocol message",
                    );
                    if !queue(out_tx, &cancel, &error).await {
                        break 'session CloseReason::PeerGone;
                    }
                    continue;
                };
                match message {
                    ClientMessage::Hello { version } => {
                        if handshake_complete {
                            debug!(version, "duplicate hello ignored");
                            continue;
                        }
                        if version != PROTOCOL_VERSION {
                            warn!(
                                client_version = version,
                                server_version = PROTOCOL_VERSION,
                                "protocol version mismatch"
                            );
                            let _ = queue(out_tx, &cancel, &version_mismatch_error(version)).await;
                            break 'session CloseReason::VersionMismatch;
                        }
                        handshake_complete = true;
                        debug!("handshake complete");
                        let hello = ServerMessage::ServerHello { version: PROTOCOL_VERSION };
                        if !queue(out_tx, &cancel, &hello).await {
                            break 'session CloseReason::PeerGone;
                        }
                    }
                    ClientMessage::Subscribe { stream_id, after_seq } => {
                        if !handshake_complete {
                            debug!(stream_id = %stream_id, "subscribe before handshake ignored");
                            continue;
                        }
                        let after_seq = after_seq.unwrap_or(0);
                        next_generation += 1;
                        let generation = next_generation;
                        info!(stream_id = %stream_id, after_seq, generation, "subscribe");
                        // Last write wins: a resubscribe replaces any prior
                        // subscription and its in-flight replay.
                        if let Some(old) = subscriptions.insert(stream_id.clone(), Subscription::new(generation)) {
                            if old.is_live() {
                                streams_left_live(state, 1);
                            }
                        }
                        counter!(REPLAYS_TOTAL).increment(1);
                        spawn_replay(
                            Arc::clone(&state.store),
                            handle.command_sender(),
                            stream_id,
                            after_seq,
                            generation,
                        );
                    }
                    ClientMessage::Unsubscribe { stream_id } => {
                        if !handshake_complete {
                            debug!(stream_id = %stream_id, "unsubscribe before handshake ignored");
                            continue;
                        }
                        debug!(stream_id = %stream_id, "unsubscribe");
                        if let Some(old) = subscriptions.remove(&stream_id) {
                            if old.is_live() {
                                streams_left_live(state, 1);
                            }
                        }
                    }
                    ClientMessage::Pong => {
                        heartbeat.pong_received();
                    }
                }
            }

            command = cmd_rx.recv() => {
                let Some(command) = command else {
                    break 'session CloseReason::Cancelled;
                };
                match command {
                    ConnCommand::Deliver { event } => {
                        let Some(sub) = subscriptions.get_mut(&event.stream_id) else {
                            continue;
                        };
                        match sub.accept_live(&event, max_buffer) {
                            LiveAction::Forward => {
                                counter!(EVENTS_DELIVERED_TOTAL).increment(1);
                                let frame = ServerMessage::event((*event).clone());
                                if !queue(out_tx, &cancel, &frame).await {
                                    break 'session CloseReason::PeerGone;
                                }
                            }
                            LiveAction::Buffered | LiveAction::Discard => {}
                            LiveAction::Overflow => {
                                warn!(
                                    stream_id = %event.stream_id,
                                    max_buffer,
                                    "replay buffer overflow"
                                );
                                counter!(BUFFER_OVERFLOWS_TOTAL).increment(1);
                                let error = ServerMessage::error(
                                    ErrorCode::BufferOverflow,
                                    format!(
                                        "replay buffer for stream {} exceeded {max_buffer} events",
                                        event.stream_id
                                    ),
                                );
                                let _ = queue(out_tx, &cancel, &error).await;
                                break 'session CloseReason::BufferOverflow;
                            }
                        }
                    }
                    ConnCommand::ReplayLoaded { stream_id, generation, result } => {
                        let Some(sub) = subscriptions.get_mut(&stream_id) else {
                            debug!(stream_id = %stream_id, generation, "replay result for dropped subscription discarded");
                            continue;
                        };
                        if sub.generation != generation {
                            debug!(
                                stream_id = %stream_id,
                                generation,
                                current = sub.generation,
                                "stale replay result discarded"
                            );
                            continue;
                        }
                        match result {
                            Ok(batch) => {
                                debug!(
                                    stream_id = %stream_id,
                                    replayed = batch.events.len(),
                                    last_replay_seq = batch.last_replay_seq,
                                    "replay complete"
                                );
                                let drained = sub.complete_replay(batch.last_replay_seq);
                                stream_went_live(state);
                                for event in batch.events {
                                    counter!(EVENTS_DELIVERED_TOTAL).increment(1);
                                    if !queue(out_tx, &cancel, &ServerMessage::event(event)).await {
                                        break 'session CloseReason::PeerGone;
                                    }
                                }
                                let end = ServerMessage::replay_end(
                                    stream_id.clone(),
                                    batch.last_replay_seq,
                                );
                                if !queue(out_tx, &cancel, &end).await {
                                    break 'session CloseReason::PeerGone;
                                }
                                for event in drained {
                                    counter!(EVENTS_DELIVERED_TOTAL).increment(1);
                                    let frame = ServerMessage::event((*event).clone());
                                    if !queue(out_tx, &cancel, &frame).await {
                                        break 'session CloseReason::PeerGone;
                                    }
                                }
                            }
                            Err(error) => {
                                warn!(stream_id = %stream_id, error = %error, "replay failed");
                                counter!(REPLAY_FAILURES_TOTAL).increment(1);
                                sub.fail_replay();
                                let message = ServerMessage::error(
                                    ErrorCode::ReplayFailed,
                                    format!("replay for stream {stream_id} failed"),
                                );
                                if !queue(out_tx, &cancel, &message).await {
                                    break 'session CloseReason::PeerGone;
                                }
                            }
                        }
                    }
                }
            }

            _ = ping_interval.tick() => {
                // Pings are only sent to handshaken clients, and never
                // while one is already outstanding.
                if handshake_complete && !heartbeat.is_awaiting() {
                    if !queue(out_tx, &cancel, &ServerMessage::Ping).await {
                        break 'session CloseReason::PeerGone;
                    }
                    heartbeat = HeartbeatState::ping_sent(
                        Instant::now() + state.config.heartbeat_timeout(),
                    );
                }
            }

            () = pong_deadline(heartbeat) => {
                warn!("pong deadline expired, closing connection");
                break 'session CloseReason::HeartbeatTimeout;
            }

            () = cancel.cancelled() => {
                debug!("connection cancelled");
                break 'session CloseReason::Cancelled;
            }
        }
    };

    streams_left_live(state, subscriptions.values().filter(|s| s.is_live()).count());
    reason
}

/// Queue an encoded frame for the writer, giving up if the connection is
/// cancelled first. Returns `false` when the frame could not be queued.
async fn queue(
    out_tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    message: &ServerMessage,
) -> bool {
    let frame = encode_message(message);
    tokio::select! {
        sent = out_tx.send(frame) => sent.is_ok(),
        () = cancel.cancelled() => false,
    }
}

/// Read history for a subscription off the session loop and send the
/// result back tagged with the generation that requested it.
fn spawn_replay(
    store: Arc<dyn EventStore>,
    cmd_tx: mpsc::Sender<ConnCommand>,
    stream_id: StreamId,
    after_seq: i64,
    generation: u64,
) {
    drop(tokio::spawn(async move {
        let started = std::time::Instant::now();
        let result = store.replay(&stream_id, after_seq).await.map(|events| {
            let last_replay_seq = events.last().map_or(after_seq, |event| event.seq);
            ReplayBatch { events, last_replay_seq }
        });
        histogram!(REPLAY_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        let _ = cmd_tx.send(ConnCommand::ReplayLoaded { stream_id, generation, result }).await;
    }));
}

/// Error payload for a hello carrying the wrong protocol version.
fn version_mismatch_error(client_version: u32) -> ServerMessage {
    ServerMessage::error(
        ErrorCode::VersionMismatch,
        format!("server speaks protocol version {PROTOCOL_VERSION}, client sent {client_version}"),
    )
}

/// Track a subscription entering live delivery.
fn stream_went_live(state: &AppState) {
    let _ = state.streams_live.fetch_add(1, Ordering::Relaxed);
    gauge!(STREAMS_LIVE).increment(1.0);
}

/// Track live subscriptions going away: unsubscribe, resubscribe, or
/// connection teardown.
fn streams_left_live(state: &AppState, count: usize) {
    if count == 0 {
        return;
    }
    let _ = state.streams_live.fetch_sub(count, Ordering::Relaxed);
    #[allow(clippy::cast_precision_loss)]
    gauge!(STREAMS_LIVE).decrement(count as f64);
}
