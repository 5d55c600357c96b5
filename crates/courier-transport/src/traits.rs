//! Transport abstraction traits for Courier.
//!
//! A transport carries envelopes between the client and the hub. It owns
//! framing, connection setup and any encryption/compression; the client
//! only sees whole envelopes.

use async_trait::async_trait;
use courier_protocol::{Compression, Encryption, Envelope};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The transport has not been opened.
    #[error("Transport is not open")]
    NotOpen,

    /// The URI cannot be used by this transport.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The requested capability is not supported.
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] courier_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A client-side envelope transport.
///
/// Implementations must make [`Transport::recv`] cancel-safe: the client
/// polls it inside `tokio::select!` and drops the future whenever an
/// outbound operation wins the race. Partially read data has to survive in
/// the transport's own buffers.
#[async_trait]
pub trait Transport: Send {
    /// Open a connection to `uri`.
    async fn open(&mut self, uri: &str) -> Result<(), TransportError>;

    /// Send an envelope.
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Receive the next envelope.
    ///
    /// Returns `None` if the connection was closed cleanly.
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError>;

    /// Close the connection gracefully. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is open.
    fn is_open(&self) -> bool;

    /// Get the transport name (e.g., "tcp", "websocket").
    fn name(&self) -> &'static str;

    /// Compression modes this transport can switch to.
    fn supported_compression(&self) -> Vec<Compression> {
        vec![Compression::None]
    }

    /// Encryption modes this transport can switch to.
    fn supported_encryption(&self) -> Vec<Encryption> {
        vec![Encryption::None]
    }

    /// Switch the compression mode.
    async fn set_compression(&mut self, compression: Compression) -> Result<(), TransportError> {
        match compression {
            Compression::None => Ok(()),
            other => Err(TransportError::Unsupported(format!(
                "{} compression: {:?}",
                self.name(),
                other
            ))),
        }
    }

    /// Switch the encryption mode.
    async fn set_encryption(&mut self, encryption: Encryption) -> Result<(), TransportError> {
        match encryption {
            Encryption::None => Ok(()),
            other => Err(TransportError::Unsupported(format!(
                "{} encryption: {:?}",
                self.name(),
                other
            ))),
        }
    }

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}
