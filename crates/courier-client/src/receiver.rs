//! Receiver registries for inbound messages and notifications.
//!
//! A registry is an ordered list of `(predicate, handler)` entries. An
//! inbound envelope goes to the handler of the first entry whose predicate
//! matches, and to no other.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use courier_protocol::{Event, Message, Notification};
use tracing::{debug, trace};

/// Error returned by a receiver handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a receiver handler.
pub type HandlerResult = Result<(), HandlerError>;

/// A receiver handler.
pub type Handler<E> = Box<dyn FnMut(&E) -> HandlerResult + Send>;

/// Atomic counter for receiver identifiers.
static RECEIVER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifies one registered receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(u64);

impl ReceiverId {
    /// Allocate a fresh identifier, unique within the process.
    #[must_use]
    pub fn next() -> Self {
        Self(RECEIVER_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Envelopes that receivers can be registered for.
pub trait Receivable {
    /// The value an exact-match predicate compares against: the content type
    /// of a message, the event of a notification.
    fn match_key(&self) -> &str;
}

impl Receivable for Message {
    fn match_key(&self) -> &str {
        &self.content_type
    }
}

impl Receivable for Notification {
    fn match_key(&self) -> &str {
        self.event.as_str()
    }
}

/// Decides whether a receiver is eligible for an envelope.
pub enum Predicate<E> {
    /// Matches every envelope.
    Always,
    /// Matches envelopes whose [`Receivable::match_key`] equals the value.
    Exact(String),
    /// Matches envelopes for which the function returns `true`.
    Custom(Box<dyn Fn(&E) -> bool + Send>),
}

impl<E: Receivable> Predicate<E> {
    /// Build a predicate from a matcher function.
    pub fn custom<F>(matcher: F) -> Self
    where
        F: Fn(&E) -> bool + Send + 'static,
    {
        Predicate::Custom(Box::new(matcher))
    }

    /// Evaluate the predicate.
    pub fn matches(&self, envelope: &E) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Exact(value) => envelope.match_key() == value.as_str(),
            Predicate::Custom(matcher) => matcher(envelope),
        }
    }
}

impl<E> std::fmt::Debug for Predicate<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Always => f.write_str("Always"),
            Predicate::Exact(value) => f.debug_tuple("Exact").field(value).finish(),
            Predicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl<E> From<&str> for Predicate<E> {
    fn from(value: &str) -> Self {
        Predicate::Exact(value.to_string())
    }
}

impl<E> From<String> for Predicate<E> {
    fn from(value: String) -> Self {
        Predicate::Exact(value)
    }
}

impl<E> From<Option<&str>> for Predicate<E> {
    fn from(value: Option<&str>) -> Self {
        value.map_or(Predicate::Always, Predicate::from)
    }
}

impl From<Event> for Predicate<Notification> {
    fn from(event: Event) -> Self {
        Predicate::Exact(event.into())
    }
}

/// What happened when an envelope was dispatched to a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No receiver matched.
    Unhandled,
    /// A receiver matched and its handler succeeded.
    Handled,
    /// A receiver matched and its handler failed; carries the error text.
    Failed(String),
}

struct Entry<E> {
    id: ReceiverId,
    predicate: Predicate<E>,
    handler: Handler<E>,
}

/// An ordered registry of receivers.
pub struct ReceiverRegistry<E> {
    name: &'static str,
    entries: Vec<Entry<E>>,
}

impl<E: Receivable> ReceiverRegistry<E> {
    /// Create an empty registry. `name` is used in log output.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
        }
    }

    /// Register a receiver at the end of the registry.
    pub fn register<F>(&mut self, predicate: impl Into<Predicate<E>>, handler: F) -> ReceiverId
    where
        F: FnMut(&E) -> HandlerResult + Send + 'static,
    {
        let id = ReceiverId::next();
        self.insert(id, predicate.into(), Box::new(handler));
        id
    }

    /// Register a receiver under an identifier allocated by the caller.
    pub fn insert(&mut self, id: ReceiverId, predicate: Predicate<E>, handler: Handler<E>) {
        debug!(registry = self.name, receiver = ?id, predicate = ?predicate, "Receiver added");
        self.entries.push(Entry {
            id,
            predicate,
            handler,
        });
    }

    /// Remove a receiver.
    ///
    /// Returns `true` if it was registered. Removing twice is a no-op.
    pub fn remove(&mut self, id: ReceiverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        let removed = self.entries.len() != before;
        if removed {
            debug!(registry = self.name, receiver = ?id, "Receiver removed");
        }
        removed
    }

    /// Remove every receiver.
    pub fn clear(&mut self) {
        debug!(registry = self.name, count = self.entries.len(), "Receivers cleared");
        self.entries.clear();
    }

    /// Number of registered receivers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Receiver identifiers in registration order.
    #[must_use]
    pub fn ids(&self) -> Vec<ReceiverId> {
        self.entries.iter().map(|entry| entry.id).collect()
    }

    /// Hand `envelope` to the first matching receiver.
    ///
    /// Handler errors and panics are captured and reported as
    /// [`DispatchOutcome::Failed`].
    pub fn dispatch(&mut self, envelope: &E) -> DispatchOutcome {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.predicate.matches(envelope))
        else {
            trace!(registry = self.name, key = envelope.match_key(), "No receiver matched");
            return DispatchOutcome::Unhandled;
        };

        let handler = &mut entry.handler;
        match panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(e)) => DispatchOutcome::Failed(e.to_string()),
            Err(payload) => DispatchOutcome::Failed(panic_message(payload.as_ref())),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "receiver panicked".to_string()
    }
}
