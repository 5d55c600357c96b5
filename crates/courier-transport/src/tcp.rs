//! TCP transport implementation.
//!
//! Envelopes are written to the socket as JSON objects back to back.

use async_trait::async_trait;
use bytes::BytesMut;
use courier_protocol::{codec, Envelope};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::traits::{Transport, TransportError};

const URI_SCHEME: &str = "net.tcp://";

/// Parse `host:port` or `net.tcp://host:port[/]` into a connect address.
///
/// # Errors
///
/// Returns an error if no host or port can be found.
pub fn parse_tcp_uri(uri: &str) -> Result<String, TransportError> {
    let address = uri
        .strip_prefix(URI_SCHEME)
        .unwrap_or(uri)
        .trim_end_matches('/');

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(address.to_string())
        }
        _ => Err(TransportError::InvalidUri(uri.to_string())),
    }
}

/// A TCP transport.
#[derive(Debug, Default)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    read_buffer: BytesMut,
    trace_enabled: bool,
}

impl TcpTransport {
    /// Create a new, unopened TCP transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every envelope sent and received at trace level.
    #[must_use]
    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.trace_enabled = enabled;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self, uri: &str) -> Result<(), TransportError> {
        let address = parse_tcp_uri(uri)?;
        let stream = TcpStream::connect(&address).await?;
        stream.set_nodelay(true)?;

        debug!(address = %address, "TCP transport connected");

        self.read_buffer.clear();
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let data = codec::encode(envelope)?;

        if self.trace_enabled {
            trace!(envelope = %String::from_utf8_lossy(&data), "TCP SEND");
        }

        stream
            .write_all(&data)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        loop {
            // First, try to decode from the existing buffer
            match codec::decode_from(&mut self.read_buffer) {
                Ok(Some(envelope)) => {
                    if self.trace_enabled {
                        trace!(envelope = ?envelope, "TCP RECEIVE");
                    }
                    return Ok(Some(envelope));
                }
                Ok(None) => {}
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "Skipping invalid envelope");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            // Need more data - read from the socket
            let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
            let read = stream.read_buf(&mut self.read_buffer).await?;
            if read == 0 {
                debug!("TCP stream ended");
                self.stream = None;
                return Ok(None);
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(()); // Already closed
        };

        stream
            .shutdown()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn remote_addr(&self) -> Option<String> {
        self.stream
            .as_ref()
            .and_then(|s| s.peer_addr().ok())
            .map(|a| a.to_string())
    }
}
