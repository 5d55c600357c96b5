//! Envelope handling for the mock hub.
//!
//! Each connection owns a [`HubSession`]. Inbound envelopes are turned into
//! replies without touching the socket, so the behavior can be tested on
//! its own.

use base64::Engine;
use courier_protocol::{
    media_types, AuthenticationScheme, Command, CommandStatus, Compression, Encryption, Envelope,
    Event, Message, Method, Node, Notification, Reason, Session, SessionState,
};
use serde_json::json;
use tracing::{debug, warn};

/// Credential value the hub always rejects, for plain passwords and keys.
pub const REJECTED_SECRET: &str = "invalid";

/// Reason code for rejected credentials.
pub const AUTHENTICATION_FAILED_CODE: i32 = 13;

/// Reason code for commands on unknown resources.
pub const RESOURCE_NOT_FOUND_CODE: i32 = 67;

/// Resource whose commands the hub accepts but never answers.
pub const UNANSWERED_URI: &str = "/void";

/// What the connection loop should do after an envelope.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Envelopes to write back, in order.
    pub replies: Vec<Envelope>,
    /// The session was just established.
    pub established: bool,
    /// The session is over; close the connection after the replies.
    pub close: bool,
}

impl Outcome {
    fn reply(envelope: impl Into<Envelope>) -> Self {
        Self {
            replies: vec![envelope.into()],
            ..Self::default()
        }
    }
}

/// Server side of one client session.
#[derive(Debug)]
pub struct HubSession {
    id: String,
    state: SessionState,
    hub: Node,
    client: Option<Node>,
}

impl HubSession {
    /// Start a session for a fresh connection.
    #[must_use]
    pub fn new(domain: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::New,
            hub: Node::new("postmaster", domain, Some("hub".into())),
            client: None,
        }
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The authenticated client node.
    #[must_use]
    pub fn client(&self) -> Option<&Node> {
        self.client.as_ref()
    }

    /// Handle one inbound envelope.
    pub fn handle(&mut self, envelope: Envelope) -> Outcome {
        match envelope {
            Envelope::Session(session) => self.on_session(session),
            _ if self.state != SessionState::Established => {
                warn!(session = %self.id, kind = envelope.kind().as_str(), "Envelope before session established");
                Outcome::default()
            }
            Envelope::Command(command) => self.on_command(command),
            Envelope::Message(message) => self.on_message(message),
            Envelope::Notification(notification) => self.on_notification(notification),
        }
    }

    fn on_session(&mut self, session: Session) -> Outcome {
        let id = Some(self.id.clone());

        match (self.state, session.state) {
            (SessionState::New, SessionState::New) => {
                self.state = SessionState::Negotiating;
                let mut offer = Session::new(SessionState::Negotiating).with_id(id);
                offer.compression_options = Some(vec![Compression::None]);
                offer.encryption_options = Some(vec![Encryption::None]);
                Outcome::reply(offer)
            }
            (SessionState::Negotiating, SessionState::Negotiating) => {
                let compression = session.compression.unwrap_or(Compression::None);
                let encryption = session.encryption.unwrap_or(Encryption::None);
                if compression != Compression::None || encryption != Encryption::None {
                    return self.fail(AUTHENTICATION_FAILED_CODE, "Unsupported transport options");
                }

                self.state = SessionState::Authenticating;
                let mut confirm = Session::new(SessionState::Negotiating).with_id(id.clone());
                confirm.compression = Some(compression);
                confirm.encryption = Some(encryption);

                let mut authenticating = Session::new(SessionState::Authenticating).with_id(id);
                authenticating.scheme_options = Some(vec![
                    AuthenticationScheme::Guest,
                    AuthenticationScheme::Plain,
                    AuthenticationScheme::Key,
                ]);

                Outcome {
                    replies: vec![confirm.into(), authenticating.into()],
                    ..Outcome::default()
                }
            }
            (SessionState::Authenticating, SessionState::Authenticating) => {
                self.on_authenticate(session)
            }
            (SessionState::Established, SessionState::Finishing) => {
                debug!(session = %self.id, "Session finishing");
                self.state = SessionState::Finished;
                Outcome {
                    replies: vec![Session::new(SessionState::Finished).with_id(id).into()],
                    close: true,
                    ..Outcome::default()
                }
            }
            (current, requested) => {
                warn!(session = %self.id, ?current, ?requested, "Unexpected session transition");
                self.fail(AUTHENTICATION_FAILED_CODE, "Invalid session state")
            }
        }
    }

    fn on_authenticate(&mut self, session: Session) -> Outcome {
        let Some(from) = session.from else {
            return self.fail(AUTHENTICATION_FAILED_CODE, "Missing node");
        };
        let authentication = session.authentication.unwrap_or_default();

        let accepted = match session.scheme {
            Some(AuthenticationScheme::Guest) => true,
            Some(AuthenticationScheme::Plain) => authentication["password"]
                .as_str()
                .and_then(|p| base64::engine::general_purpose::STANDARD.decode(p).ok())
                .is_some_and(|p| p != REJECTED_SECRET.as_bytes()),
            Some(AuthenticationScheme::Key) => authentication["key"]
                .as_str()
                .is_some_and(|k| k != REJECTED_SECRET),
            _ => false,
        };

        if !accepted {
            debug!(session = %self.id, node = %from, scheme = ?session.scheme, "Authentication rejected");
            return self.fail(AUTHENTICATION_FAILED_CODE, "Invalid credentials");
        }

        self.state = SessionState::Established;
        self.client = Some(from.clone());
        debug!(session = %self.id, node = %from, "Session established");

        Outcome {
            replies: vec![Session::established(Some(self.id.clone()), self.hub.clone(), from).into()],
            established: true,
            close: false,
        }
    }

    fn fail(&mut self, code: i32, description: &str) -> Outcome {
        self.state = SessionState::Failed;
        Outcome {
            replies: vec![Session::failed(Some(self.id.clone()), Reason::new(code, description)).into()],
            close: true,
            ..Outcome::default()
        }
    }

    fn on_command(&mut self, command: Command) -> Outcome {
        if command.is_response() {
            return Outcome::default();
        }

        let mut response = match (command.method, command.uri.as_deref()) {
            (_, Some(UNANSWERED_URI)) => {
                debug!(session = %self.id, id = ?command.id, "Leaving command unanswered");
                return Outcome::default();
            }
            (Method::Get, Some("/ping")) => command
                .respond(CommandStatus::Success)
                .with_resource(media_types::PING, json!({})),
            (Method::Set, Some("/presence")) | (Method::Set, Some("/receipt")) => {
                command.respond(CommandStatus::Success)
            }
            (method, uri) => {
                debug!(session = %self.id, ?method, ?uri, "Unknown resource");
                command
                    .respond(CommandStatus::Failure)
                    .with_reason(Reason::new(RESOURCE_NOT_FOUND_CODE, "Resource not found"))
            }
        };
        response.from = Some(self.hub.clone());
        response.to = self.client.clone();
        Outcome::reply(response)
    }

    fn on_message(&mut self, message: Message) -> Outcome {
        if message.content.as_str() != Some("ping") {
            return Outcome::default();
        }
        let mut pong = Message::new(message.content_type.clone(), "pong").with_from(self.hub.clone());
        pong.id = Some(uuid::Uuid::new_v4().to_string());
        pong.to = message.from.or_else(|| self.client.clone());
        Outcome::reply(pong)
    }

    fn on_notification(&mut self, notification: Notification) -> Outcome {
        // Notifications are echoed back; `ping` is answered with `pong`.
        let mut reply = notification;
        if reply.event.as_str() == "ping" {
            reply.event = Event::from("pong");
        }
        reply.from = Some(self.hub.clone());
        reply.to = self.client.clone();
        Outcome::reply(reply)
    }
}
