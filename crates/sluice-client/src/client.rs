//! Replication client over `tokio-tungstenite`.
//!
//! The socket is owned by a spawned handler task; the public types talk
//! to it through channels. [`ReplicationClient`] sends subscribe and
//! unsubscribe commands, each [`SubscriptionHandle`] receives its
//! stream's events, and connection-level notices (server errors, the
//! disconnect) arrive via [`ReplicationClient::next_notice`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use sluice_proto::{
    ClientMessage, ErrorCode, PROTOCOL_VERSION, ServerMessage, StoredEvent, StreamId,
    decode_server_message, encode_message,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the server's handshake reply.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Events buffered per subscription before the read loop waits.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// In-flight commands from client methods to the handler task.
const COMMAND_QUEUE_CAPACITY: usize = 32;

/// Connection-level notices held for [`ReplicationClient::next_notice`].
const NOTICE_QUEUE_CAPACITY: usize = 32;

/// Connection-level notice delivered outside any subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientNotice {
    /// Structured error reported by the server.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },
    /// The connection ended. No reconnection is attempted.
    Disconnected,
}

/// Commands from the public API to the handler task.
enum ClientCommand {
    Subscribe {
        stream_id: StreamId,
        after_seq: Option<i64>,
        route: StreamRoute,
    },
    Unsubscribe {
        stream_id: StreamId,
    },
    Close,
}

/// Handler-side routing entry for one subscribed stream.
struct StreamRoute {
    events_tx: mpsc::Sender<StoredEvent>,
    replay_tx: Option<oneshot::Sender<i64>>,
    live: Arc<AtomicBool>,
}

/// A connected replication client.
///
/// Dropping the client tears the connection down; [`close`] does the same
/// but lets the close frame flush first.
///
/// [`close`]: ReplicationClient::close
#[derive(Debug)]
pub struct ReplicationClient {
    cmd_tx: mpsc::Sender<ClientCommand>,
    notice_rx: mpsc::Receiver<ClientNotice>,
    handler: JoinHandle<()>,
}

impl ReplicationClient {
    /// Connect to a server and complete the version handshake.
    ///
    /// The hello goes out immediately; anything other than a matching
    /// `server-hello` within the handshake window is an error.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (mut ws, _response) = connect_async(url).await?;

        let hello = encode_message(&ClientMessage::Hello { version: PROTOCOL_VERSION });
        ws.send(Message::text(hello)).await?;

        let reply = timeout(HANDSHAKE_TIMEOUT, read_server_message(&mut ws))
            .await
            .map_err(|_| ClientError::HandshakeTimeout)??;
        match reply {
            ServerMessage::ServerHello { version } => {
                debug!(version, "handshake complete");
            }
            ServerMessage::Error { code, message } => {
                return Err(ClientError::Rejected { code, message });
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "unexpected handshake reply: {other:?}"
                )));
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_QUEUE_CAPACITY);
        let handler = tokio::spawn(handler_loop(ws, cmd_rx, notice_tx));

        Ok(Self { cmd_tx, notice_rx, handler })
    }

    /// Subscribe to a stream, replaying history above `after_seq` first.
    ///
    /// `None` replays the whole stream. Subscribing again to the same
    /// stream supersedes the previous subscription and its handle.
    pub async fn subscribe(
        &self,
        stream_id: impl Into<StreamId>,
        after_seq: Option<i64>,
    ) -> Result<SubscriptionHandle, ClientError> {
        let stream_id = stream_id.into();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (replay_tx, replay_rx) = oneshot::channel();
        let live = Arc::new(AtomicBool::new(false));

        let route = StreamRoute { events_tx, replay_tx: Some(replay_tx), live: Arc::clone(&live) };
        self.cmd_tx
            .send(ClientCommand::Subscribe { stream_id: stream_id.clone(), after_seq, route })
            .await
            .map_err(|_| ClientError::Closed)?;

        Ok(SubscriptionHandle { stream_id, events_rx, replay_rx: Some(replay_rx), live })
    }

    /// Drop the subscription for a stream.
    pub async fn unsubscribe(&self, stream_id: impl Into<StreamId>) -> Result<(), ClientError> {
        self.cmd_tx
            .send(ClientCommand::Unsubscribe { stream_id: stream_id.into() })
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Next connection-level notice; `None` once the connection is gone
    /// and all queued notices are drained.
    pub async fn next_notice(&mut self) -> Option<ClientNotice> {
        self.notice_rx.recv().await
    }

    /// Close the connection, flushing the close frame.
    pub async fn close(mut self) {
        let _ = self.cmd_tx.send(ClientCommand::Close).await;
        if timeout(Duration::from_secs(2), &mut self.handler).await.is_err() {
            self.handler.abort();
        }
    }
}

impl Drop for ReplicationClient {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

/// Receiving side of one subscription.
///
/// Events arrive in sequence order: replayed history first, live events
/// after. Consume them promptly; the connection's read loop waits when a
/// subscription's queue is full.
pub struct SubscriptionHandle {
    stream_id: StreamId,
    events_rx: mpsc::Receiver<StoredEvent>,
    replay_rx: Option<oneshot::Receiver<i64>>,
    live: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    /// The subscribed stream.
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Next event for this stream; `None` once the subscription or the
    /// connection is gone.
    pub async fn next_event(&mut self) -> Option<StoredEvent> {
        self.events_rx.recv().await
    }

    /// Wait for the replay phase to finish; returns the highest replayed
    /// sequence (or the resume point when replay found nothing newer).
    ///
    /// Fails with [`ClientError::Closed`] when the subscription was
    /// superseded or the connection ended before replay completed.
    pub async fn wait_replay_complete(&mut self) -> Result<i64, ClientError> {
        match self.replay_rx.take() {
            Some(replay_rx) => replay_rx.await.map_err(|_| ClientError::Closed),
            None => Err(ClientError::Protocol("replay completion already awaited".into())),
        }
    }

    /// Whether live delivery has started for this subscription.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }
}

/// Read frames until a protocol message arrives.
async fn read_server_message(ws: &mut WsStream) -> Result<ServerMessage, ClientError> {
    loop {
        let frame = ws.next().await.ok_or(ClientError::Closed)??;
        match frame {
            Message::Text(text) => {
                return decode_server_message(text.as_str())
                    .ok_or_else(|| ClientError::Protocol("undecodable server frame".into()));
            }
            Message::Close(_) => return Err(ClientError::Closed),
            _ => {}
        }
    }
}

/// Socket handler: routes incoming frames to subscriptions, answers
/// pings, and writes outgoing commands.
async fn handler_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    notice_tx: mpsc::Sender<ClientNotice>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut routes: HashMap<StreamId, StreamRoute> = HashMap::new();

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    ClientCommand::Subscribe { stream_id, after_seq, route } => {
                        let frame = encode_message(&ClientMessage::Subscribe {
                            stream_id: stream_id.clone(),
                            after_seq,
                        });
                        let _ = routes.insert(stream_id, route);
                        if ws_tx.send(Message::text(frame)).await.is_err() {
                            break;
                        }
                    }
                    ClientCommand::Unsubscribe { stream_id } => {
                        let _ = routes.remove(&stream_id);
                        let frame = encode_message(&ClientMessage::Unsubscribe { stream_id });
                        if ws_tx.send(Message::text(frame)).await.is_err() {
                            break;
                        }
                    }
                    ClientCommand::Close => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            frame = ws_rx.next() => {
                let Some(Ok(frame)) = frame else { break };
                let text = match frame {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Some(message) = decode_server_message(text.as_str()) else {
                    warn!("discarding undecodable server frame");
                    continue;
                };
                match message {
                    ServerMessage::Ping => {
                        let pong = encode_message(&ClientMessage::Pong);
                        if ws_tx.send(Message::text(pong)).await.is_err() {
                            break;
                        }
                    }
                    ServerMessage::Event { stream_id, event } => {
                        if let Some(route) = routes.get(&stream_id) {
                            if route.events_tx.send(event).await.is_err() {
                                // Handle dropped; stop routing the stream.
                                let _ = routes.remove(&stream_id);
                            }
                        }
                    }
                    ServerMessage::ReplayEnd { stream_id, last_replay_seq } => {
                        if let Some(route) = routes.get_mut(&stream_id) {
                            debug!(stream_id = %stream_id, last_replay_seq, "replay complete");
                            route.live.store(true, Ordering::Relaxed);
                            if let Some(replay_tx) = route.replay_tx.take() {
                                let _ = replay_tx.send(last_replay_seq);
                            }
                        }
                    }
                    ServerMessage::Error { code, message } => {
                        warn!(code = %code, message, "server reported an error");
                        let _ = notice_tx.try_send(ClientNotice::Error { code, message });
                    }
                    ServerMessage::ServerHello { version } => {
                        debug!(version, "unexpected server-hello ignored");
                    }
                }
            }
        }
    }

    debug!("connection handler exiting");
    for route in routes.values() {
        route.live.store(false, Ordering::Relaxed);
    }
    let _ = notice_tx.try_send(ClientNotice::Disconnected);
}
