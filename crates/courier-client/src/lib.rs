//! # courier-client
//!
//! Client for LIME-style messaging hubs.
//!
//! This crate provides the session and dispatch layer on top of a
//! [`courier_transport::Transport`]:
//!
//! - **Client** - Connect, send envelopes and manage receivers
//! - **Handshake** - Session negotiation and authentication
//! - **Bootstrap** - Presence and receipt setup after authentication
//! - **Dispatcher** - Routes inbound envelopes and acknowledges messages
//! - **Correlator** - Matches command responses to pending requests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Client    │────▶│   Driver    │────▶│  Transport  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │ Dispatcher  │────▶│  Receivers  │
//!                     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │ Correlator  │
//!                     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use courier_client::{Client, ClientConfig};
//! use courier_protocol::{Command, Message};
//!
//! let client = Client::tcp(ClientConfig::load()?);
//! client.add_message_receiver("text/plain", |message: &Message| {
//!     println!("{}", message.content);
//!     Ok(())
//! });
//! client.connect_with_guest("guest")?.await?;
//! let response = client.send_command(Command::get("/ping")).await?;
//! ```

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod metrics;
pub mod receiver;

pub use bootstrap::{ClientState, Presence, PresenceStatus, Receipt, RoutingRule};
pub use client::{Client, ReceiverToken};
pub use config::ClientConfig;
pub use correlator::CommandCorrelator;
pub use dispatch::{Dispatcher, HANDLER_FAILURE_REASON_CODE};
pub use error::ClientError;
pub use handshake::{Credentials, EstablishedSession};
pub use receiver::{
    DispatchOutcome, Handler, HandlerError, HandlerResult, Predicate, Receivable, ReceiverId,
    ReceiverRegistry,
};
