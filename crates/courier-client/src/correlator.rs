//! Request/response correlation for outbound commands.
//!
//! Every outbound command is registered under its identifier before it is
//! written to the transport. When a response with the same identifier
//! arrives, the waiter is completed and the entry removed.
//!
//! ```text
//! send:    assign id -> register waiter -> transmit
//! resolve: lookup id -> remove entry -> complete waiter (success | failure)
//! close:   fail every remaining waiter with ConnectionClosed
//! ```

use std::collections::HashMap;
use std::time::Instant;

use courier_protocol::Command;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::ClientError;
use crate::metrics;

/// Outcome delivered to a command waiter.
pub type CommandResult = Result<Command, ClientError>;

/// Give `command` a fresh identifier unless it already has one.
///
/// Returns the identifier the command will be correlated by.
pub fn assign_id(command: &mut Command) -> String {
    command
        .id
        .get_or_insert_with(|| Uuid::new_v4().to_string())
        .clone()
}

struct PendingCommand {
    waiter: oneshot::Sender<CommandResult>,
    uri: Option<String>,
    sent_at: Instant,
}

/// Table of commands awaiting a response.
#[derive(Default)]
pub struct CommandCorrelator {
    pending: HashMap<String, PendingCommand>,
}

impl CommandCorrelator {
    /// Create an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `command` and the waiter its response will be delivered to.
    ///
    /// Assigns an identifier if the command has none and returns it.
    pub fn register(&mut self, command: &mut Command, waiter: oneshot::Sender<CommandResult>) -> String {
        let id = assign_id(command);
        let entry = PendingCommand {
            waiter,
            uri: command.uri.clone(),
            sent_at: Instant::now(),
        };

        if self.pending.insert(id.clone(), entry).is_some() {
            warn!(id = %id, "Command identifier reused while pending, previous waiter dropped");
        }
        trace!(id = %id, uri = ?command.uri, pending = self.pending.len(), "Command registered");
        metrics::set_pending_commands(self.pending.len());
        id
    }

    /// Complete the waiter matching `response`.
    ///
    /// A `success` status fulfills the waiter; any other status rejects it
    /// with [`ClientError::CommandFailed`] carrying the response. Returns
    /// `false` if nothing was pending under the response identifier.
    pub fn resolve(&mut self, response: Command) -> bool {
        let Some(id) = response.id.as_deref() else {
            return false;
        };
        let Some(entry) = self.pending.remove(id) else {
            debug!(id = %id, "Response for unknown or already resolved command");
            return false;
        };
        metrics::set_pending_commands(self.pending.len());

        debug!(
            id = %id,
            uri = ?entry.uri,
            status = ?response.status,
            elapsed_ms = entry.sent_at.elapsed().as_millis() as u64,
            "Command resolved"
        );

        let outcome = if response.is_success() {
            metrics::record_command("success");
            Ok(response)
        } else {
            metrics::record_command("failure");
            Err(ClientError::CommandFailed(Box::new(response)))
        };

        // The caller may have stopped waiting.
        let _ = entry.waiter.send(outcome);
        true
    }

    /// Fail a single pending command.
    pub fn fail(&mut self, id: &str, error: ClientError) -> bool {
        match self.pending.remove(id) {
            Some(entry) => {
                metrics::set_pending_commands(self.pending.len());
                let _ = entry.waiter.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop a pending command without completing it.
    pub fn abandon(&mut self, id: &str) -> bool {
        let removed = self.pending.remove(id).is_some();
        if removed {
            debug!(id = %id, "Command abandoned");
            metrics::set_pending_commands(self.pending.len());
        }
        removed
    }

    /// Fail every pending command with [`ClientError::ConnectionClosed`].
    ///
    /// Returns the number of waiters failed.
    pub fn fail_all(&mut self) -> usize {
        let count = self.pending.len();
        for (id, entry) in self.pending.drain() {
            trace!(id = %id, "Failing pending command");
            let _ = entry.waiter.send(Err(ClientError::ConnectionClosed));
        }
        if count > 0 {
            debug!(count, "Failed pending commands");
        }
        metrics::set_pending_commands(0);
        count
    }

    /// Whether a command is pending under `id`.
    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of pending commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no command is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
