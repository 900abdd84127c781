//! Relay signaling channel: a persistent, ordered, bidirectional message
//! stream carrying the typed wire protocol from [`crate::protocol`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use crate::protocol::{ClientMessage, ServerMessage};

pub mod memory;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid relay url {0}")]
    InvalidUrl(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    ChannelClosed,
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError>;

    /// Next inbound relay message; `None` once the channel is gone.
    async fn recv(&self) -> Option<ServerMessage>;

    /// Graceful close: flush a close frame before the channel is released.
    async fn close(&self);
}

enum WriterCommand {
    Message(ClientMessage),
    Close,
}

pub struct WebSocketSignaling {
    send_tx: mpsc::UnboundedSender<WriterCommand>,
    recv_rx: AsyncMutex<mpsc::UnboundedReceiver<ServerMessage>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketSignaling {
    pub async fn connect(relay_server: &str) -> Result<Arc<Self>, SignalingError> {
        let websocket_url = derive_websocket_url(relay_server)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        tracing::debug!(target = "signaling", url = %websocket_url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<WriterCommand>();
        let (recv_tx, recv_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let writer_handle = tokio::spawn(async move {
            while let Some(command) = send_rx.recv().await {
                match command {
                    WriterCommand::Message(message) => {
                        let Ok(text) = serde_json::to_string(&message) else {
                            continue;
                        };
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    WriterCommand::Close => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        forward_frame(text.as_bytes(), &recv_tx);
                    }
                    Ok(Message::Binary(data)) => {
                        forward_frame(&data, &recv_tx);
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(
                                    target = "signaling",
                                    "relay websocket closed: {err}"
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    target = "signaling",
                                    "relay websocket error: {err}"
                                );
                            }
                        }
                        break;
                    }
                }
            }
        });

        let channel = Arc::new(Self {
            send_tx,
            recv_rx: AsyncMutex::new(recv_rx),
            tasks: parking_lot::Mutex::new(vec![writer_handle, reader_handle]),
        });
        Ok(channel)
    }
}

fn forward_frame(raw: &[u8], recv_tx: &mpsc::UnboundedSender<ServerMessage>) {
    match serde_json::from_slice::<ServerMessage>(raw) {
        Ok(message) => {
            let _ = recv_tx.send(message);
        }
        Err(err) => {
            // unknown relay message types are ignored, not fatal
            tracing::debug!(target = "signaling", error = %err, "ignoring undecodable relay frame");
        }
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignaling {
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        self.send_tx
            .send(WriterCommand::Message(message))
            .map_err(|_| SignalingError::ChannelClosed)
    }

    async fn recv(&self) -> Option<ServerMessage> {
        let mut rx = self.recv_rx.lock().await;
        rx.recv().await
    }

    async fn close(&self) {
        let _ = self.send_tx.send(WriterCommand::Close);
    }
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Accepts `host:port`, `http(s)://…`, or an explicit `ws(s)://…` endpoint
/// and yields the relay's `/ws` websocket url.
fn derive_websocket_url(relay_server: &str) -> Result<Url, SignalingError> {
    let with_scheme = if relay_server.contains("://") {
        relay_server.to_string()
    } else {
        format!("ws://{relay_server}")
    };
    let mut url =
        Url::parse(&with_scheme).map_err(|_| SignalingError::InvalidUrl(relay_server.into()))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => None,
        "http" => Some("ws"),
        "https" => Some("wss"),
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "{relay_server}: unsupported scheme {other}"
            )));
        }
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::InvalidUrl(relay_server.into()))?;
    }
    if url.path() == "/" || url.path().is_empty() {
        url.set_path("/ws");
    }
    Ok(url)
}
