//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client transport using tokio-tungstenite.
//! Each envelope travels in its own text frame.

use async_trait::async_trait;
use courier_protocol::{codec, Envelope};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, trace, warn};

use crate::traits::{Transport, TransportError};

/// Default maximum frame size accepted from the hub (64 KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum message size in bytes.
    pub max_message_size: usize,
    /// Log every envelope at trace level.
    pub trace_enabled: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            trace_enabled: false,
        }
    }
}

/// A WebSocket transport.
pub struct WebSocketTransport {
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new, unopened WebSocket transport with default config.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(WebSocketConfig::default())
    }

    /// Create a new WebSocket transport.
    #[must_use]
    pub fn with_config(config: WebSocketConfig) -> Self {
        Self {
            stream: None,
            config,
        }
    }

    fn decode_frame(&self, data: &[u8]) -> Result<Option<Envelope>, TransportError> {
        if data.len() > self.config.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                data.len(),
                self.config.max_message_size
            );
            return Err(TransportError::Protocol(
                courier_protocol::ProtocolError::EnvelopeTooLarge(data.len()),
            ));
        }

        match codec::decode(data) {
            Ok(envelope) => {
                if self.config.trace_enabled {
                    trace!(envelope = ?envelope, "WebSocket RECEIVE");
                }
                Ok(Some(envelope))
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Skipping invalid envelope");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&mut self, uri: &str) -> Result<(), TransportError> {
        if !(uri.starts_with("ws://") || uri.starts_with("wss://")) {
            return Err(TransportError::InvalidUri(uri.to_string()));
        }

        let (stream, _response) = connect_async(uri).await.map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            TransportError::Other(format!("WebSocket handshake failed: {}", e))
        })?;

        debug!(uri = %uri, "WebSocket transport connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let data = codec::encode(envelope)?;
        let text = String::from_utf8(data.to_vec())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        if self.config.trace_enabled {
            trace!(envelope = %text, "WebSocket SEND");
        }

        stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        loop {
            let next = {
                let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
                stream.next().await
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    if let Some(envelope) = self.decode_frame(text.as_bytes())? {
                        return Ok(Some(envelope));
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Some(envelope) = self.decode_frame(&data)? {
                        return Ok(Some(envelope));
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    // Pings are answered by tungstenite on the next write or read
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.stream = None;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!("WebSocket stream ended");
                    self.stream = None;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.stream = None;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(()); // Already closed
        };

        stream
            .close(None)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}
