//! # courier-transport
//!
//! Transport abstraction layer for the Courier messaging hub client.
//!
//! This crate provides a unified interface over the byte channels a client
//! can use to reach a hub:
//!
//! - **TCP** - Envelopes as back-to-back JSON objects on a socket
//! - **WebSocket** - One envelope per text frame
//!
//! ## Transport Abstraction
//!
//! All transports implement the `Transport` trait, allowing the client to be
//! protocol-agnostic.
//!
//! ```rust,ignore
//! use courier_transport::{TcpTransport, Transport};
//!
//! let mut transport = TcpTransport::new();
//! transport.open("127.0.0.1:8124").await?;
//! while let Some(envelope) = transport.recv().await? {
//!     // Process envelope
//! }
//! ```

pub mod tcp;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use tcp::TcpTransport;
pub use traits::{Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
