//! # courier-protocol
//!
//! Envelope protocol definitions for the Courier messaging hub client.
//!
//! This crate defines the JSON envelopes exchanged between a client and a
//! messaging hub, node addressing, and the stream codec.
//!
//! ## Envelope Types
//!
//! - `Message` - Application content addressed to a node
//! - `Notification` - Lifecycle events about a message (received, consumed, failed, ...)
//! - `Command` - Request/response operations on hub resources
//! - `Session` - Handshake and teardown of a connection
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Envelope, Message};
//!
//! let envelope = Envelope::from(Message::text("Hello, world!"));
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod node;
pub mod session;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{
    media_types, Command, CommandStatus, Envelope, EnvelopeKind, Event, Message, Method,
    Notification, Reason,
};
pub use node::Node;
pub use session::{
    Authentication, AuthenticationScheme, Compression, Encryption, Session, SessionState,
};
