//! Byte transports carrying MQTT packets.
//!
//! A `Connector` opens a `Link`: a pair of byte channels. The session
//! never sees WebSocket frames, only the bytes inside them, so tests can
//! swap in the in-memory broker from [`crate::mock`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::error::{MqttError, MqttResult};

/// An open connection. Dropping `tx` closes the link; `rx` yields `None`
/// once the peer has gone away.
#[derive(Debug)]
pub struct Link {
    pub tx: mpsc::Sender<Vec<u8>>,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link to the presigned endpoint `url`.
    async fn open(&self, url: &str) -> MqttResult<Link>;
}

// ── WebSocket ─────────────────────────────────────────────────

const SUBPROTOCOL: &str = "mqtt";
const DEFAULT_BUFFER: usize = 64;

/// Production connector: MQTT inside binary WebSocket frames.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    buffer: usize,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self {
            buffer: DEFAULT_BUFFER,
        }
    }

    /// Capacity of the per-direction byte queues.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> MqttResult<Link> {
        let mut request = url
            .into_client_request()
            .map_err(|e| MqttError::Transport(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        let (stream, _response) = connect_async(request).await.map_err(classify_ws_error)?;
        tracing::debug!("websocket upgraded");
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.buffer);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(self.buffer);

        tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Binary(bytes)).await {
                    tracing::warn!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Binary(bytes)) => {
                        if in_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(reason)) => {
                        tracing::info!(?reason, "websocket closed by peer");
                        break;
                    }
                    // Ping/pong is answered by tungstenite; text frames are not MQTT.
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "websocket read failed");
                        break;
                    }
                }
            }
        });

        Ok(Link {
            tx: out_tx,
            rx: in_rx,
        })
    }
}

/// Upgrade refusals with 401/403 mean the signature or token is stale.
fn classify_ws_error(error: WsError) -> MqttError {
    match &error {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            MqttError::AuthenticationExpired(format!(
                "websocket upgrade refused with {}",
                response.status()
            ))
        }
        _ => MqttError::Transport(error.to_string()),
    }
}
