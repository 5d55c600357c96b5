//! Inbound envelope dispatch.
//!
//! The dispatcher classifies every inbound envelope and routes it to the
//! command correlator or one of the receiver registries. It never performs
//! I/O: envelopes it wants sent (the automatic message notifications) are
//! returned in order, and the caller writes them to the transport before
//! handling the next inbound envelope.

use courier_protocol::{Envelope, Event, Message, Notification, Reason};
use tracing::{debug, trace, warn};

use crate::correlator::CommandCorrelator;
use crate::metrics;
use crate::receiver::{DispatchOutcome, ReceiverRegistry};

/// Reason code of the `failed` notification sent when a message receiver fails.
pub const HANDLER_FAILURE_REASON_CODE: i32 = 101;

/// Routes inbound envelopes.
pub struct Dispatcher {
    messages: ReceiverRegistry<Message>,
    notifications: ReceiverRegistry<Notification>,
    correlator: CommandCorrelator,
}

impl Dispatcher {
    /// Create a dispatcher with empty registries.
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: ReceiverRegistry::new("messages"),
            notifications: ReceiverRegistry::new("notifications"),
            correlator: CommandCorrelator::new(),
        }
    }

    /// The message receiver registry.
    pub fn messages(&mut self) -> &mut ReceiverRegistry<Message> {
        &mut self.messages
    }

    /// The notification receiver registry.
    pub fn notifications(&mut self) -> &mut ReceiverRegistry<Notification> {
        &mut self.notifications
    }

    /// The pending command table.
    pub fn correlator(&mut self) -> &mut CommandCorrelator {
        &mut self.correlator
    }

    /// Route one inbound envelope.
    ///
    /// Returns the envelopes to send in response, in order.
    pub fn on_envelope(&mut self, envelope: Envelope) -> Vec<Envelope> {
        metrics::record_envelope(envelope.kind().as_str(), "inbound");
        let mut outbox = Vec::new();

        match envelope {
            Envelope::Command(command) if command.is_response() => {
                self.correlator.resolve(command);
            }
            Envelope::Command(command) => {
                debug!(id = ?command.id, method = ?command.method, uri = ?command.uri, "Dropping inbound command request");
            }
            Envelope::Notification(notification) => match self.notifications.dispatch(&notification) {
                DispatchOutcome::Handled => {}
                DispatchOutcome::Failed(description) => {
                    warn!(
                        id = ?notification.id,
                        event = notification.event.as_str(),
                        error = %description,
                        "Notification receiver failed"
                    );
                    metrics::record_handler_failure();
                }
                DispatchOutcome::Unhandled => {
                    trace!(event = notification.event.as_str(), "Unhandled notification dropped");
                }
            },
            Envelope::Message(message) => self.on_message(message, &mut outbox),
            Envelope::Session(session) => {
                debug!(state = ?session.state, "Dropping session envelope");
            }
        }

        outbox
    }

    fn on_message(&mut self, message: Message, outbox: &mut Vec<Envelope>) {
        outbox.push(Notification::for_message(&message, Event::Received).into());

        match self.messages.dispatch(&message) {
            DispatchOutcome::Handled => {
                outbox.push(Notification::for_message(&message, Event::Consumed).into());
            }
            DispatchOutcome::Failed(description) => {
                warn!(id = ?message.id, error = %description, "Message receiver failed");
                metrics::record_handler_failure();
                let reason = Reason::new(HANDLER_FAILURE_REASON_CODE, description);
                outbox.push(
                    Notification::for_message(&message, Event::Failed)
                        .with_reason(reason)
                        .into(),
                );
            }
            DispatchOutcome::Unhandled => {
                trace!(id = ?message.id, content_type = %message.content_type, "Unhandled message");
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::receiver::Predicate;
    use courier_protocol::{Command, CommandStatus, Method};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    fn notification(envelope: &Envelope) -> &Notification {
        match envelope {
            Envelope::Notification(n) => n,
            other => panic!("Expected notification, got {:?}", other),
        }
    }

    #[test]
    fn test_received_then_consumed() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.messages().register(Predicate::Always, |_: &Message| Ok(()));

        let outbox = dispatcher.on_envelope(Message::text("test").with_id("m1").into());

        assert_eq!(outbox.len(), 2);
        assert_eq!(notification(&outbox[0]).event, Event::Received);
        assert_eq!(notification(&outbox[0]).id.as_deref(), Some("m1"));
        assert_eq!(notification(&outbox[1]).event, Event::Consumed);
        assert_eq!(notification(&outbox[1]).id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_received_then_failed_with_reason() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .messages()
            .register(Predicate::Always, |_: &Message| Err("test error".into()));

        let outbox = dispatcher.on_envelope(Message::text("test").into());

        assert_eq!(outbox.len(), 2);
        assert_eq!(notification(&outbox[0]).event, Event::Received);
        let failed = notification(&outbox[1]);
        assert_eq!(failed.event, Event::Failed);
        let reason = failed.reason.as_ref().unwrap();
        assert_eq!(reason.code, 101);
        assert_eq!(reason.description.as_deref(), Some("test error"));
    }

    #[test]
    fn test_unhandled_message_only_received() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.messages().register("sometype", |_: &Message| Ok(()));

        let outbox = dispatcher.on_envelope(Message::new("application/unknown", "this looks odd").into());

        assert_eq!(outbox.len(), 1);
        assert_eq!(notification(&outbox[0]).event, Event::Received);
    }

    #[test]
    fn test_received_precedes_handler() {
        let mut dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        dispatcher.messages().register(Predicate::Always, move |_: &Message| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        let outbox = dispatcher.on_envelope(Message::text("a").with_from("alice@msging.net/x").into());
        assert_eq!(*seen.lock().unwrap(), 1);
        // Notifications go back to the sender.
        assert_eq!(
            notification(&outbox[0]).to.as_ref().map(ToString::to_string).as_deref(),
            Some("alice@msging.net/x")
        );
    }

    #[test]
    fn test_notifications_are_routed() {
        let mut dispatcher = Dispatcher::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        dispatcher.notifications().register(Event::Consumed, move |n: &Notification| {
            sink.lock().unwrap().push(n.event.clone());
            Ok(())
        });

        assert!(dispatcher.on_envelope(Notification::new(Event::Received).into()).is_empty());
        assert!(dispatcher.on_envelope(Notification::new(Event::Consumed).into()).is_empty());
        assert_eq!(*events.lock().unwrap(), vec![Event::Consumed]);
    }

    #[tokio::test]
    async fn test_command_response_resolves_waiter() {
        let mut dispatcher = Dispatcher::new();
        let mut command = Command::get("/ping").with_id("test");
        let (tx, rx) = oneshot::channel();
        dispatcher.correlator().register(&mut command, tx);

        let outbox = dispatcher.on_envelope(command.respond(CommandStatus::Success).into());
        assert!(outbox.is_empty());
        assert!(rx.await.unwrap().is_ok());
    }

    #[test]
    fn test_failed_notification_receiver_sends_nothing() {
        let mut dispatcher = Dispatcher::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        dispatcher
            .notifications()
            .register(Event::Received, |_: &Notification| Err("test error".into()));
        dispatcher.notifications().register(Predicate::Always, move |n: &Notification| {
            sink.lock().unwrap().push(n.event.clone());
            Ok(())
        });

        // No failed notification answers a notification.
        assert!(dispatcher.on_envelope(Notification::new(Event::Received).into()).is_empty());
        assert!(events.lock().unwrap().is_empty());

        assert!(dispatcher.on_envelope(Notification::new(Event::Consumed).into()).is_empty());
        assert_eq!(*events.lock().unwrap(), vec![Event::Consumed]);
    }

    #[tokio::test]
    async fn test_status_only_response_rejects_waiter() {
        let mut dispatcher = Dispatcher::new();
        let mut command = Command::get("/unknown").with_id("test");
        let (tx, rx) = oneshot::channel();
        dispatcher.correlator().register(&mut command, tx);

        let response: Envelope = serde_json::from_value(json!({
            "id": "test",
            "status": "failure",
            "reason": {"code": 67, "description": "Unsupported resource"}
        }))
        .unwrap();
        assert!(dispatcher.on_envelope(response).is_empty());
        assert!(!dispatcher.correlator().is_pending("test"));

        match rx.await.unwrap() {
            Err(ClientError::CommandFailed(response)) => {
                assert_eq!(response.reason.unwrap().code, 67);
            }
            other => panic!("Expected command failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_command_request_is_dropped() {
        let mut dispatcher = Dispatcher::new();
        let mut command = Command::get("/ping").with_id("no_id_for_this");
        let (tx, mut rx) = oneshot::channel::<Result<Command, ClientError>>();
        dispatcher.correlator().register(&mut command, tx);

        // Same id but no status: a request, not a response.
        let request: Envelope = serde_json::from_value(json!({"id": "no_id_for_this", "method": "get"})).unwrap();
        assert!(dispatcher.on_envelope(request).is_empty());
        assert!(dispatcher.correlator().is_pending("no_id_for_this"));
        assert!(rx.try_recv().is_err());

        let set = Command::new(Method::Set, "/contacts");
        assert!(dispatcher.on_envelope(set.into()).is_empty());
    }
}
