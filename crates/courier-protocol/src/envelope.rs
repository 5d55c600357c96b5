//! Envelope types for the hub protocol.
//!
//! Envelopes are the unit of communication with the hub. Every envelope is
//! a JSON object; its kind is not tagged explicitly but inferred from the
//! fields it carries (see [`Envelope::from_value`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;
use crate::node::Node;
use crate::session::Session;

/// Well-known media types used by the client.
pub mod media_types {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const JSON: &str = "application/json";
    pub const PRESENCE: &str = "application/vnd.lime.presence+json";
    pub const RECEIPT: &str = "application/vnd.lime.receipt+json";
    pub const PING: &str = "application/vnd.lime.ping+json";
}

/// Envelope metadata.
pub type Metadata = BTreeMap<String, String>;

/// Reason attached to failed notifications, failed commands and failed sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    /// Numeric reason code.
    pub code: i32,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Reason {
    /// Create a new reason.
    #[must_use]
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{} (code {})", description, self.code),
            None => write!(f, "code {}", self.code),
        }
    }
}

/// Notification event tags.
///
/// Unknown tags are preserved in [`Event::Other`] so receivers can still
/// match on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Event {
    Accepted,
    Validated,
    Authorized,
    Dispatched,
    Received,
    Consumed,
    Failed,
    Other(String),
}

impl Event {
    /// The wire name of the event.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Event::Accepted => "accepted",
            Event::Validated => "validated",
            Event::Authorized => "authorized",
            Event::Dispatched => "dispatched",
            Event::Received => "received",
            Event::Consumed => "consumed",
            Event::Failed => "failed",
            Event::Other(name) => name,
        }
    }
}

impl From<String> for Event {
    fn from(value: String) -> Self {
        match value.as_str() {
            "accepted" => Event::Accepted,
            "validated" => Event::Validated,
            "authorized" => Event::Authorized,
            "dispatched" => Event::Dispatched,
            "received" => Event::Received,
            "consumed" => Event::Consumed,
            "failed" => Event::Failed,
            _ => Event::Other(value),
        }
    }
}

impl From<&str> for Event {
    fn from(value: &str) -> Self {
        Event::from(value.to_string())
    }
}

impl From<Event> for String {
    fn from(event: Event) -> String {
        match event {
            Event::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

/// Command methods.
///
/// Responses may omit the method; it then reads as `get`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Get,
    Set,
    Delete,
    Observe,
    Subscribe,
    Unsubscribe,
    Merge,
}

/// Status of a command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Success,
    Failure,
    Pending,
}

/// A message envelope carrying application content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Node>,
    /// MIME type of the content.
    #[serde(rename = "type")]
    pub content_type: String,
    /// Message payload.
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Message {
    /// Create a new message without identifier.
    #[must_use]
    pub fn new(content_type: impl Into<String>, content: impl Into<Value>) -> Self {
        Self {
            id: None,
            from: None,
            to: None,
            content_type: content_type.into(),
            content: content.into(),
            metadata: None,
        }
    }

    /// Create a `text/plain` message.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(media_types::TEXT_PLAIN, Value::String(text.into()))
    }

    /// Set the message identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the destination node.
    #[must_use]
    pub fn with_to(mut self, to: impl Into<Node>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Set the originating node.
    #[must_use]
    pub fn with_from(mut self, from: impl Into<Node>) -> Self {
        self.from = Some(from.into());
        self
    }
}

/// A notification envelope reporting an event about a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Identifier of the message this notification refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Node>,
    pub event: Event,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Notification {
    /// Create a new notification.
    #[must_use]
    pub fn new(event: impl Into<Event>) -> Self {
        Self {
            id: None,
            from: None,
            to: None,
            event: event.into(),
            reason: None,
            metadata: None,
        }
    }

    /// Create a notification correlated to `message`, addressed back to its sender.
    #[must_use]
    pub fn for_message(message: &Message, event: impl Into<Event>) -> Self {
        Self {
            id: message.id.clone(),
            to: message.from.clone(),
            ..Self::new(event)
        }
    }

    /// Set the correlated message identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// A command envelope, either a request or a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Node>,
    #[serde(default)]
    pub method: Method,
    /// Target resource path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// MIME type of the resource.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    /// Present on responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CommandStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Command {
    /// Create a new command request.
    #[must_use]
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            id: None,
            from: None,
            to: None,
            method,
            uri: Some(uri.into()),
            resource_type: None,
            resource: None,
            status: None,
            reason: None,
            metadata: None,
        }
    }

    /// Create a `get` command.
    #[must_use]
    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::Get, uri)
    }

    /// Create a `set` command carrying a typed resource.
    #[must_use]
    pub fn set(uri: impl Into<String>, resource_type: impl Into<String>, resource: Value) -> Self {
        Self::new(Method::Set, uri).with_resource(resource_type, resource)
    }

    /// Set the command identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the sender node.
    #[must_use]
    pub fn with_from(mut self, from: impl Into<Node>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Attach a typed resource.
    #[must_use]
    pub fn with_resource(mut self, resource_type: impl Into<String>, resource: Value) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource = Some(resource);
        self
    }

    /// Build the response to this command with the given status.
    ///
    /// The response keeps the identifier and method and is addressed back to
    /// the requester.
    #[must_use]
    pub fn respond(&self, status: CommandStatus) -> Self {
        Self {
            id: self.id.clone(),
            from: None,
            to: self.from.clone(),
            method: self.method,
            uri: None,
            resource_type: None,
            resource: None,
            status: Some(status),
            reason: None,
            metadata: None,
        }
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Whether this command is a response (carries an identifier and a status).
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.status.is_some()
    }

    /// Whether this is a successful response.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == Some(CommandStatus::Success)
    }
}

/// Envelope kinds, mostly useful for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Message,
    Notification,
    Command,
    Session,
}

impl EnvelopeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Message => "message",
            EnvelopeKind::Notification => "notification",
            EnvelopeKind::Command => "command",
            EnvelopeKind::Session => "session",
        }
    }
}

/// A protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Message(Message),
    Notification(Notification),
    Command(Command),
    Session(Session),
}

impl Envelope {
    /// Classify and parse a JSON value into an envelope.
    ///
    /// The kind is decided by the first matching rule:
    /// - `state` present: session
    /// - `method` or `status` present: command
    /// - `event` present: notification
    /// - `content` or `type` present: message
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] if the value is not an object, matches
    /// no rule, or does not have the shape of its kind.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(fields) = &value else {
            return Err(ProtocolError::Invalid("envelope is not a JSON object".into()));
        };

        let kind = if fields.contains_key("state") {
            EnvelopeKind::Session
        } else if fields.contains_key("method") || fields.contains_key("status") {
            EnvelopeKind::Command
        } else if fields.contains_key("event") {
            EnvelopeKind::Notification
        } else if fields.contains_key("content") || fields.contains_key("type") {
            EnvelopeKind::Message
        } else {
            return Err(ProtocolError::Invalid("unknown envelope kind".into()));
        };

        let invalid = |e: serde_json::Error| ProtocolError::Invalid(format!("{}: {}", kind.as_str(), e));
        let envelope = match kind {
            EnvelopeKind::Session => Envelope::Session(serde_json::from_value(value).map_err(invalid)?),
            EnvelopeKind::Command => Envelope::Command(serde_json::from_value(value).map_err(invalid)?),
            EnvelopeKind::Notification => {
                Envelope::Notification(serde_json::from_value(value).map_err(invalid)?)
            }
            EnvelopeKind::Message => Envelope::Message(serde_json::from_value(value).map_err(invalid)?),
        };
        Ok(envelope)
    }

    /// Get the envelope kind.
    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Message(_) => EnvelopeKind::Message,
            Envelope::Notification(_) => EnvelopeKind::Notification,
            Envelope::Command(_) => EnvelopeKind::Command,
            Envelope::Session(_) => EnvelopeKind::Session,
        }
    }

    /// Get the envelope identifier, if any.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Envelope::Message(m) => m.id.as_deref(),
            Envelope::Notification(n) => n.id.as_deref(),
            Envelope::Command(c) => c.id.as_deref(),
            Envelope::Session(s) => s.id.as_deref(),
        }
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Envelope::from_value(value).map_err(serde::de::Error::custom)
    }
}

impl From<Message> for Envelope {
    fn from(m: Message) -> Self {
        Envelope::Message(m)
    }
}

impl From<Notification> for Envelope {
    fn from(n: Notification) -> Self {
        Envelope::Notification(n)
    }
}

impl From<Command> for Envelope {
    fn from(c: Command) -> Self {
        Envelope::Command(c)
    }
}

impl From<Session> for Envelope {
    fn from(s: Session) -> Self {
        Envelope::Session(s)
    }
}
