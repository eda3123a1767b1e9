//! Realtime listening channel
//!
//! One WebSocket connection per listening episode. The controller opens the
//! channel when listening begins, sends capture commands over it, and closes
//! it when listening ends for any reason; there is never more than one open
//! channel. Incoming frames are parsed into [`ServerEvent`]s and forwarded to
//! the controller's event queue tagged with the episode that opened the
//! connection, so events from a torn-down episode can be discarded.

mod messages;

pub use messages::{ClientCommand, ServerEvent};

use crate::controller::SessionEvent;
use crate::error::ChannelError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// WebSocket connect timeout in seconds
const WS_CONNECT_TIMEOUT_SECS: u64 = 10;

/// What the receive task feeds back to the controller
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A parsed server event
    Event(ServerEvent),
    /// The connection closed or failed; the episode is over
    Disconnected,
}

/// Opens realtime channels
///
/// A trait so the controller can be exercised against a recording fake; the
/// production implementation is [`WsConnector`].
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Open a channel bound to `device_index` for the given episode.
    ///
    /// Parsed events arrive on `events` as [`SessionEvent::Channel`] entries
    /// tagged with `episode`.
    async fn open(
        &self,
        device_index: usize,
        episode: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<ChannelHandle, ChannelError>;
}

/// Handle to one open listening channel
///
/// Owned exclusively by the controller for the duration of one episode.
pub struct ChannelHandle {
    command_tx: Option<mpsc::UnboundedSender<ClientCommand>>,
    connected: Arc<AtomicBool>,
    recv_task: Option<tokio::task::JoinHandle<()>>,
}

impl ChannelHandle {
    pub(crate) fn from_parts(
        command_tx: mpsc::UnboundedSender<ClientCommand>,
        connected: Arc<AtomicBool>,
        recv_task: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self {
            command_tx: Some(command_tx),
            connected,
            recv_task,
        }
    }

    /// Send a command; best-effort once the channel is closing.
    pub fn send(&self, command: ClientCommand) {
        if let Some(tx) = &self.command_tx {
            if tx.send(command).is_err() {
                warn!("Channel command dropped: send task has exited");
            }
        }
    }

    /// Whether the server side of the connection is still up
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close the channel; idempotent and safe to call at any time.
    ///
    /// Commands already queued are still flushed before the send task closes
    /// the socket.
    pub fn close(&mut self) {
        if self.command_tx.take().is_some() {
            info!("Realtime channel closed");
        }
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// WebSocket-backed channel connector
pub struct WsConnector {
    websocket_url: String,
}

impl WsConnector {
    /// Create a connector for the listening endpoint at `websocket_url`.
    pub fn new(websocket_url: &str) -> Result<Self, ChannelError> {
        url::Url::parse(websocket_url)
            .map_err(|e| ChannelError::InvalidEndpoint(e.to_string()))?;
        Ok(Self {
            websocket_url: websocket_url.to_string(),
        })
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn open(
        &self,
        device_index: usize,
        episode: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<ChannelHandle, ChannelError> {
        info!(
            url = %self.websocket_url,
            device_index,
            episode,
            "Opening realtime channel"
        );

        let ws_result = timeout(
            Duration::from_secs(WS_CONNECT_TIMEOUT_SECS),
            connect_async(self.websocket_url.as_str()),
        )
        .await;

        let ws_stream = match ws_result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                error!("Realtime channel connection failed: {}", e);
                return Err(ChannelError::Connect(e.to_string()));
            }
            Err(_) => {
                error!("Realtime channel connection timed out");
                return Err(ChannelError::ConnectTimeout);
            }
        };

        info!("Realtime channel connected");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<ClientCommand>();
        let connected = Arc::new(AtomicBool::new(true));

        // Send task: drain commands onto the socket, then close it. The
        // command channel closing (handle drop or explicit close) is the
        // signal to shut the sink down.
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let json = match serde_json::to_string(&command) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize channel command: {}", e);
                        continue;
                    }
                };
                debug!("Sending channel command: {}", json);
                if ws_sink.send(Message::Text(json)).await.is_err() {
                    warn!("Failed to send channel command");
                    break;
                }
            }
            let _ = ws_sink.close().await;
            debug!("Channel send task exiting");
        });

        // Receive task: parse incoming frames into server events. Stream end
        // or a transport error ends the episode with a Disconnected event.
        let connected_recv = connected.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(msg_result) = ws_stream.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                let _ = events.send(SessionEvent::Channel {
                                    episode,
                                    event: ChannelEvent::Event(event),
                                });
                            }
                            Err(e) => {
                                warn!("Unrecognized channel message: {} - {}", e, text);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("Realtime channel closed by server");
                        break;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Err(e) => {
                        error!("Realtime channel receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            connected_recv.store(false, Ordering::SeqCst);
            let _ = events.send(SessionEvent::Channel {
                episode,
                event: ChannelEvent::Disconnected,
            });
        });

        Ok(ChannelHandle::from_parts(
            command_tx,
            connected,
            Some(recv_task),
        ))
    }
}
