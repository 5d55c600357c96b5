//! The client handle and its driver task.
//!
//! A [`Client`] is a cheap, cloneable handle. Every client owns one driver
//! task that holds the transport, the receiver registries, the pending
//! command table and the session state. Handles talk to the driver over an
//! unbounded operation queue; results come back over oneshot channels and
//! the session state is published through a watch channel.
//!
//! ```text
//!  Client ──ops──▶ ┌──────────────────────────────┐
//!  Client ──ops──▶ │ Driver                       │ ◀──envelopes── Transport
//!                  │  Dispatcher                  │
//!  state ◀─watch── │   ├─ message receivers       │ ──envelopes──▶ Transport
//!                  │   ├─ notification receivers  │
//!                  │   └─ command correlator      │
//!                  └──────────────────────────────┘
//! ```
//!
//! Receiver handlers run on the driver task. A handler that needs the client
//! captures a clone of the handle; operations it submits are queued and run
//! after the current envelope is done. Closing drops every receiver, so
//! such clones do not keep the driver alive.

use std::future::Future;
use std::sync::Arc;

use courier_protocol::{Command, Envelope, Message, Node, Notification, Session, SessionState};
use courier_transport::{TcpTransport, Transport, TransportError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::bootstrap::{bootstrap_commands, ClientState};
use crate::config::ClientConfig;
use crate::correlator::{assign_id, CommandResult};
use crate::dispatch::Dispatcher;
use crate::error::ClientError;
use crate::handshake::{self, Credentials};
use crate::metrics;
use crate::receiver::{Handler, HandlerResult, Predicate, ReceiverId};

/// Observable client status.
#[derive(Debug, Clone)]
struct Status {
    state: ClientState,
    local_node: Option<Node>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverKind {
    Message,
    Notification,
}

/// Work submitted by handles to the driver.
enum Operation {
    Connect {
        credentials: Credentials,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    AddMessageReceiver {
        id: ReceiverId,
        predicate: Predicate<Message>,
        handler: Handler<Message>,
    },
    AddNotificationReceiver {
        id: ReceiverId,
        predicate: Predicate<Notification>,
        handler: Handler<Notification>,
    },
    RemoveReceiver {
        kind: ReceiverKind,
        id: ReceiverId,
    },
    ClearReceivers {
        kind: ReceiverKind,
    },
    Send {
        envelope: Envelope,
    },
    SendCommand {
        command: Command,
        waiter: oneshot::Sender<CommandResult>,
    },
    CancelCommand {
        id: String,
    },
    Close {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
}

struct Inner {
    operations: mpsc::UnboundedSender<Operation>,
    status: watch::Receiver<Status>,
    config: ClientConfig,
}

/// Handle to a messaging hub client.
///
/// Cloning is cheap; all clones drive the same session. The driver task
/// stops once every handle is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Create a client for the hub at `uri` using `transport`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(uri: impl Into<String>, transport: impl Transport + 'static) -> Self {
        Self::with_config(ClientConfig::new(uri), transport)
    }

    /// Create a client from a full configuration.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_config(config: ClientConfig, transport: impl Transport + 'static) -> Self {
        let (operations_tx, operations_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status {
            state: ClientState::Disconnected,
            local_node: None,
        });

        debug!(uri = %config.uri, transport = transport.name(), "Creating client");

        let driver = Driver {
            transport: Box::new(transport),
            dispatcher: Dispatcher::new(),
            config: config.clone(),
            status: status_tx,
            operations: operations_rx,
        };
        tokio::spawn(driver.run());

        Self {
            inner: Arc::new(Inner {
                operations: operations_tx,
                status: status_rx,
                config,
            }),
        }
    }

    /// Create a client that reaches the hub over TCP.
    pub fn tcp(config: ClientConfig) -> Self {
        let transport = TcpTransport::new().with_trace(config.trace);
        Self::with_config(config, transport)
    }

    /// The client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current client state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.inner.status.borrow().state
    }

    /// The node the hub assigned to this client, once established.
    #[must_use]
    pub fn local_node(&self) -> Option<Node> {
        self.inner.status.borrow().local_node.clone()
    }

    /// Wait until the client reaches `state`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] if the driver stops first.
    pub async fn wait_for_state(&self, state: ClientState) -> Result<(), ClientError> {
        let mut status = self.inner.status.clone();
        status
            .wait_for(|status| status.state == state)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Connect as a guest.
    ///
    /// The arguments are validated immediately; the returned future resolves
    /// once the session is established and bootstrapped. The connection
    /// attempt starts whether or not the future is polled.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] if `identifier` is empty.
    pub fn connect_with_guest(
        &self,
        identifier: &str,
    ) -> Result<impl Future<Output = Result<(), ClientError>> + Send + 'static, ClientError> {
        Ok(self.connect(Credentials::guest(identifier)?))
    }

    /// Connect with a plain password.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] if `identifier` or `password` is empty.
    pub fn connect_with_password(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<impl Future<Output = Result<(), ClientError>> + Send + 'static, ClientError> {
        Ok(self.connect(Credentials::password(identifier, password)?))
    }

    /// Connect with an access key.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] if `identifier` or `key` is empty.
    pub fn connect_with_key(
        &self,
        identifier: &str,
        key: &str,
    ) -> Result<impl Future<Output = Result<(), ClientError>> + Send + 'static, ClientError> {
        Ok(self.connect(Credentials::key(identifier, key)?))
    }

    fn connect(
        &self,
        credentials: Credentials,
    ) -> impl Future<Output = Result<(), ClientError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let submitted = self.submit(Operation::Connect { credentials, reply });
        async move {
            submitted?;
            rx.await.map_err(|_| ClientError::ConnectionClosed)?
        }
    }

    /// Close the session.
    ///
    /// Sends `finishing` when connected, closes the transport and fails
    /// every pending command with [`ClientError::ConnectionClosed`].
    /// Closing an already closed client does nothing.
    ///
    /// # Errors
    ///
    /// Returns the transport error if closing the connection failed. The
    /// client is closed either way.
    pub async fn close(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        if self.submit(Operation::Close { reply }).is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Register a message receiver after the existing ones.
    pub fn add_message_receiver<P, F>(&self, predicate: P, handler: F) -> ReceiverToken
    where
        P: Into<Predicate<Message>>,
        F: FnMut(&Message) -> HandlerResult + Send + 'static,
    {
        let id = ReceiverId::next();
        self.submit_quiet(Operation::AddMessageReceiver {
            id,
            predicate: predicate.into(),
            handler: Box::new(handler),
        });
        self.token(ReceiverKind::Message, id)
    }

    /// Register a notification receiver after the existing ones.
    pub fn add_notification_receiver<P, F>(&self, predicate: P, handler: F) -> ReceiverToken
    where
        P: Into<Predicate<Notification>>,
        F: FnMut(&Notification) -> HandlerResult + Send + 'static,
    {
        let id = ReceiverId::next();
        self.submit_quiet(Operation::AddNotificationReceiver {
            id,
            predicate: predicate.into(),
            handler: Box::new(handler),
        });
        self.token(ReceiverKind::Notification, id)
    }

    /// Remove every message receiver.
    pub fn clear_message_receivers(&self) {
        self.submit_quiet(Operation::ClearReceivers {
            kind: ReceiverKind::Message,
        });
    }

    /// Remove every notification receiver.
    pub fn clear_notification_receivers(&self) {
        self.submit_quiet(Operation::ClearReceivers {
            kind: ReceiverKind::Notification,
        });
    }

    /// Send a message without waiting for any acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidState`] unless the client is connected.
    pub fn send_message(&self, message: Message) -> Result<(), ClientError> {
        self.ensure_connected("send message")?;
        self.submit(Operation::Send {
            envelope: message.into(),
        })
    }

    /// Send a notification without waiting for any acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidState`] unless the client is connected.
    pub fn send_notification(&self, notification: Notification) -> Result<(), ClientError> {
        self.ensure_connected("send notification")?;
        self.submit(Operation::Send {
            envelope: notification.into(),
        })
    }

    /// Send a command and wait for its response.
    ///
    /// A command without an identifier is given a fresh one.
    ///
    /// # Errors
    ///
    /// - [`ClientError::CommandFailed`] with the response if its status is not `success`
    /// - [`ClientError::Timeout`] if no response arrives within the configured timeout
    /// - [`ClientError::ConnectionClosed`] if the session ends first
    /// - [`ClientError::InvalidState`] unless the client is connected
    pub async fn send_command(&self, mut command: Command) -> Result<Command, ClientError> {
        let id = assign_id(&mut command);
        let (waiter, rx) = oneshot::channel();
        self.submit(Operation::SendCommand { command, waiter })?;

        let outcome = match self.inner.config.command_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(id = %id, timeout_ms = timeout.as_millis() as u64, "Command timed out");
                    metrics::record_command("timeout");
                    self.submit_quiet(Operation::CancelCommand { id });
                    return Err(ClientError::Timeout);
                }
            },
            None => rx.await,
        };

        outcome.map_err(|_| ClientError::ConnectionClosed)?
    }

    fn ensure_connected(&self, operation: &'static str) -> Result<(), ClientError> {
        match self.state() {
            ClientState::Connected => Ok(()),
            state => Err(ClientError::InvalidState { operation, state }),
        }
    }

    fn submit(&self, operation: Operation) -> Result<(), ClientError> {
        self.inner
            .operations
            .send(operation)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Submit an operation whose outcome nobody waits for.
    fn submit_quiet(&self, operation: Operation) {
        if self.submit(operation).is_err() {
            trace!("Client driver stopped, operation dropped");
        }
    }

    fn token(&self, kind: ReceiverKind, id: ReceiverId) -> ReceiverToken {
        ReceiverToken {
            id,
            kind,
            operations: self.inner.operations.downgrade(),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("uri", &self.inner.config.uri)
            .field("state", &self.state())
            .finish()
    }
}

/// Removes one registered receiver.
///
/// Tokens do not keep the client alive. Removing twice, or after the
/// client has stopped, does nothing.
#[derive(Clone)]
pub struct ReceiverToken {
    id: ReceiverId,
    kind: ReceiverKind,
    operations: mpsc::WeakUnboundedSender<Operation>,
}

impl ReceiverToken {
    /// The receiver identifier.
    #[must_use]
    pub fn id(&self) -> ReceiverId {
        self.id
    }

    /// Remove the receiver.
    pub fn remove(&self) {
        if let Some(operations) = self.operations.upgrade() {
            let _ = operations.send(Operation::RemoveReceiver {
                kind: self.kind,
                id: self.id,
            });
        }
    }
}

impl std::fmt::Debug for ReceiverToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverToken")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Owns the session. Runs until every handle is dropped.
struct Driver {
    transport: Box<dyn Transport>,
    dispatcher: Dispatcher,
    config: ClientConfig,
    status: watch::Sender<Status>,
    operations: mpsc::UnboundedReceiver<Operation>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let reading = self.state() == ClientState::Connected;

            tokio::select! {
                biased;

                operation = self.operations.recv() => match operation {
                    Some(operation) => self.on_operation(operation).await,
                    None => break,
                },

                inbound = self.transport.recv(), if reading => self.on_inbound(inbound).await,
            }
        }

        if let Err(e) = self.shutdown().await {
            debug!(error = %e, "Error closing transport");
        }
        debug!("Client driver stopped");
    }

    fn state(&self) -> ClientState {
        self.status.borrow().state
    }

    fn set_state(&self, state: ClientState) {
        self.status.send_modify(|status| {
            if status.state != state {
                debug!(from = ?status.state, to = ?state, "Client state changed");
                status.state = state;
            }
        });
    }

    async fn on_operation(&mut self, operation: Operation) {
        match operation {
            Operation::Connect { credentials, reply } => {
                let state = self.state();
                let result = if state.can_connect() {
                    self.connect(&credentials).await
                } else {
                    Err(ClientError::InvalidState {
                        operation: "connect",
                        state,
                    })
                };
                let _ = reply.send(result);
            }
            Operation::AddMessageReceiver { id, .. } | Operation::AddNotificationReceiver { id, .. }
                if self.state() == ClientState::Closed =>
            {
                debug!(?id, "Client closed, receiver dropped");
            }
            Operation::AddMessageReceiver {
                id,
                predicate,
                handler,
            } => self.dispatcher.messages().insert(id, predicate, handler),
            Operation::AddNotificationReceiver {
                id,
                predicate,
                handler,
            } => self.dispatcher.notifications().insert(id, predicate, handler),
            Operation::RemoveReceiver { kind, id } => {
                match kind {
                    ReceiverKind::Message => self.dispatcher.messages().remove(id),
                    ReceiverKind::Notification => self.dispatcher.notifications().remove(id),
                };
            }
            Operation::ClearReceivers { kind } => match kind {
                ReceiverKind::Message => self.dispatcher.messages().clear(),
                ReceiverKind::Notification => self.dispatcher.notifications().clear(),
            },
            Operation::Send { envelope } => {
                if self.state() != ClientState::Connected {
                    debug!(kind = envelope.kind().as_str(), "Not connected, envelope dropped");
                    return;
                }
                if let Err(e) = self.transmit(&envelope).await {
                    warn!(error = %e, kind = envelope.kind().as_str(), "Failed to send envelope");
                }
            }
            Operation::SendCommand { mut command, waiter } => {
                let state = self.state();
                if state != ClientState::Connected {
                    let _ = waiter.send(Err(ClientError::InvalidState {
                        operation: "send command",
                        state,
                    }));
                    return;
                }
                let id = self.dispatcher.correlator().register(&mut command, waiter);
                match self.transmit(&Envelope::from(command)).await {
                    Ok(()) => metrics::record_command("sent"),
                    Err(e) => {
                        warn!(id = %id, error = %e, "Failed to send command");
                        self.dispatcher.correlator().fail(&id, e.into());
                    }
                }
            }
            Operation::CancelCommand { id } => {
                self.dispatcher.correlator().abandon(&id);
            }
            Operation::Close { reply } => {
                let _ = reply.send(self.shutdown().await);
            }
        }
    }

    async fn connect(&mut self, credentials: &Credentials) -> Result<(), ClientError> {
        self.set_state(ClientState::Authenticating);

        match self.establish(credentials).await {
            Ok(()) => {
                self.set_state(ClientState::Connected);
                info!(uri = %self.config.uri, node = ?self.status.borrow().local_node, "Client connected");
                Ok(())
            }
            Err(e) => {
                warn!(uri = %self.config.uri, error = %e, "Connection failed");
                self.terminate(ClientState::Failed).await;
                Err(e)
            }
        }
    }

    async fn establish(&mut self, credentials: &Credentials) -> Result<(), ClientError> {
        self.transport.open(&self.config.uri).await?;

        let session = handshake::establish(
            self.transport.as_mut(),
            credentials,
            &self.config.domain,
            &self.config.instance,
        )
        .await?;
        self.status
            .send_modify(|status| status.local_node = Some(session.local_node));

        self.set_state(ClientState::Bootstrapping);
        for command in bootstrap_commands() {
            self.send_bootstrap(command).await?;
        }
        Ok(())
    }

    /// Send a bootstrap command; its response is only logged.
    async fn send_bootstrap(&mut self, mut command: Command) -> Result<(), ClientError> {
        let (waiter, rx) = oneshot::channel();
        let id = self.dispatcher.correlator().register(&mut command, waiter);
        let uri = command.uri.clone().unwrap_or_default();
        self.transmit(&Envelope::from(command)).await?;

        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(_)) => debug!(id = %id, uri = %uri, "Bootstrap command succeeded"),
                Ok(Err(e)) => warn!(id = %id, uri = %uri, error = %e, "Bootstrap command failed"),
                Err(_) => trace!(id = %id, uri = %uri, "Bootstrap command abandoned"),
            }
        });
        Ok(())
    }

    async fn on_inbound(&mut self, inbound: Result<Option<Envelope>, TransportError>) {
        match inbound {
            Ok(Some(Envelope::Session(session))) => self.on_session(session).await,
            Ok(Some(envelope)) => {
                for outbound in self.dispatcher.on_envelope(envelope) {
                    if let Err(e) = self.transmit(&outbound).await {
                        warn!(error = %e, kind = outbound.kind().as_str(), "Failed to send envelope");
                    }
                }
            }
            Ok(None) => {
                warn!(uri = %self.config.uri, "Connection closed by hub");
                self.terminate(ClientState::Failed).await;
            }
            Err(e) => {
                warn!(uri = %self.config.uri, error = %e, "Transport error");
                self.terminate(ClientState::Failed).await;
            }
        }
    }

    async fn on_session(&mut self, session: Session) {
        match session.state {
            SessionState::Finished => {
                info!(id = ?session.id, "Session finished by hub");
                self.terminate(ClientState::Closed).await;
            }
            SessionState::Failed => {
                warn!(id = ?session.id, reason = ?session.reason, "Session failed by hub");
                self.terminate(ClientState::Failed).await;
            }
            state => debug!(?state, "Ignoring session envelope"),
        }
    }

    async fn transmit(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        self.transport.send(envelope).await?;
        metrics::record_envelope(envelope.kind().as_str(), "outbound");
        Ok(())
    }

    /// Close the session on our side.
    async fn shutdown(&mut self) -> Result<(), ClientError> {
        let state = self.state();
        if state == ClientState::Closed {
            return Ok(());
        }

        if state == ClientState::Connected {
            let finishing = Session::new(SessionState::Finishing);
            if let Err(e) = self.transmit(&Envelope::from(finishing)).await {
                debug!(error = %e, "Failed to send finishing session");
            }
        }

        let closed = if self.transport.is_open() {
            self.transport.close().await.map_err(ClientError::from)
        } else {
            Ok(())
        };

        self.dispatcher.correlator().fail_all();
        self.release_receivers();
        self.set_state(ClientState::Closed);
        info!(uri = %self.config.uri, "Client closed");
        closed
    }

    /// Drop every receiver along with whatever its handler captured.
    fn release_receivers(&mut self) {
        self.dispatcher.messages().clear();
        self.dispatcher.notifications().clear();
    }

    /// Drop the connection and fail everything pending.
    async fn terminate(&mut self, state: ClientState) {
        if self.transport.is_open() {
            if let Err(e) = self.transport.close().await {
                debug!(error = %e, "Error closing transport");
            }
        }
        self.dispatcher.correlator().fail_all();
        // Failed may reconnect with the same receivers; Closed is terminal.
        if state == ClientState::Closed {
            self.release_receivers();
        }
        self.set_state(state);
    }
}
