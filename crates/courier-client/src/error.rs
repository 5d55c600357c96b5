//! Client errors.

use courier_protocol::{Command, ProtocolError};
use courier_transport::TransportError;
use thiserror::Error;

use crate::bootstrap::ClientState;

/// Errors surfaced by the client API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A required argument is missing. Raised before any I/O happens.
    #[error("Invalid argument: {0}")]
    Argument(&'static str),

    /// The hub rejected the session.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The hub answered a command with a non-success status.
    #[error("Command failed: {}", describe_failure(.0))]
    CommandFailed(Box<Command>),

    /// The connection was closed while the operation was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No response arrived within the command timeout.
    #[error("Command timed out")]
    Timeout,

    /// The operation is not allowed in the current state.
    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ClientState,
    },

    /// Transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    /// The failed command response, if this is a [`ClientError::CommandFailed`].
    #[must_use]
    pub fn command_response(&self) -> Option<&Command> {
        match self {
            ClientError::CommandFailed(response) => Some(response),
            _ => None,
        }
    }
}

fn describe_failure(response: &Command) -> String {
    let id = response.id.as_deref().unwrap_or("<none>");
    match &response.reason {
        Some(reason) => format!("{} ({})", id, reason),
        None => format!("{} ({:?})", id, response.status),
    }
}
