//! Session envelopes.
//!
//! Session envelopes only travel during the handshake and teardown of a
//! connection. The client side walks `new -> [negotiating] -> authenticating
//! -> established` and later `finishing -> finished`; the hub may answer any
//! step with `failed`.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::envelope::{Metadata, Reason};
use crate::node::Node;

/// Protocol-level session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Negotiating,
    Authenticating,
    Established,
    Finishing,
    Finished,
    Failed,
}

/// Transport encryption options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    None,
    Tls,
}

/// Transport compression options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
}

/// Authentication schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationScheme {
    Guest,
    Plain,
    Key,
    Transport,
}

/// Credentials presented in the `authenticating` step.
#[derive(Clone, PartialEq, Eq)]
pub enum Authentication {
    Guest,
    /// Plain password, base64-encoded on the wire.
    Plain { password: String },
    /// Pre-encoded access key, sent as given.
    Key { key: String },
}

impl Authentication {
    /// The scheme this authentication uses.
    #[must_use]
    pub fn scheme(&self) -> AuthenticationScheme {
        match self {
            Authentication::Guest => AuthenticationScheme::Guest,
            Authentication::Plain { .. } => AuthenticationScheme::Plain,
            Authentication::Key { .. } => AuthenticationScheme::Key,
        }
    }

    /// The `authentication` field of the session envelope.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Authentication::Guest => json!({}),
            Authentication::Plain { password } => json!({
                "password": base64::engine::general_purpose::STANDARD.encode(password.as_bytes())
            }),
            Authentication::Key { key } => json!({ "key": key }),
        }
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for Authentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authentication::Guest => f.write_str("Guest"),
            Authentication::Plain { .. } => f.write_str("Plain { .. }"),
            Authentication::Key { .. } => f.write_str("Key { .. }"),
        }
    }
}

/// A session envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Node>,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_options: Option<Vec<Encryption>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<Encryption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_options: Option<Vec<Compression>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme_options: Option<Vec<AuthenticationScheme>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<AuthenticationScheme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Session {
    /// Create a bare session envelope in `state`.
    #[must_use]
    pub fn new(state: SessionState) -> Self {
        Self {
            id: None,
            from: None,
            to: None,
            state,
            encryption_options: None,
            encryption: None,
            compression_options: None,
            compression: None,
            scheme_options: None,
            scheme: None,
            authentication: None,
            reason: None,
            metadata: None,
        }
    }

    /// Set the session identifier.
    #[must_use]
    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    /// The client's negotiation choice.
    #[must_use]
    pub fn negotiate(id: Option<String>, compression: Compression, encryption: Encryption) -> Self {
        Self {
            compression: Some(compression),
            encryption: Some(encryption),
            ..Self::new(SessionState::Negotiating).with_id(id)
        }
    }

    /// The client's authentication request.
    #[must_use]
    pub fn authenticate(id: Option<String>, from: Node, authentication: &Authentication) -> Self {
        Self {
            from: Some(from),
            scheme: Some(authentication.scheme()),
            authentication: Some(authentication.to_value()),
            ..Self::new(SessionState::Authenticating).with_id(id)
        }
    }

    /// Hub confirmation that the session is established for `to`.
    #[must_use]
    pub fn established(id: Option<String>, from: Node, to: Node) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Self::new(SessionState::Established).with_id(id)
        }
    }

    /// Session failure with a reason.
    #[must_use]
    pub fn failed(id: Option<String>, reason: Reason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::new(SessionState::Failed).with_id(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_password_is_base64() {
        let auth = Authentication::Plain {
            password: "123456".into(),
        };
        assert_eq!(auth.scheme(), AuthenticationScheme::Plain);
        assert_eq!(auth.to_value(), json!({"password": "MTIzNDU2"}));
    }

    #[test]
    fn test_key_is_sent_as_given() {
        let auth = Authentication::Key {
            key: "YWJjZGVm".into(),
        };
        assert_eq!(auth.to_value(), json!({"key": "YWJjZGVm"}));
        assert_eq!(format!("{:?}", auth), "Key { .. }");
    }

    #[test]
    fn test_authenticate_envelope_shape() {
        let session = Session::authenticate(
            Some("s1".into()),
            Node::parse("guest@msging.net/default"),
            &Authentication::Guest,
        );
        assert_eq!(
            serde_json::to_value(&session).unwrap(),
            json!({
                "id": "s1",
                "from": "guest@msging.net/default",
                "state": "authenticating",
                "scheme": "guest",
                "authentication": {}
            })
        );
    }

    #[test]
    fn test_negotiating_options_parse() {
        let session: Session = serde_json::from_value(json!({
            "id": "s1",
            "state": "negotiating",
            "encryptionOptions": ["none", "tls"],
            "compressionOptions": ["none"]
        }))
        .unwrap();
        assert_eq!(session.state, SessionState::Negotiating);
        assert_eq!(session.encryption_options, Some(vec![Encryption::None, Encryption::Tls]));
    }
}
