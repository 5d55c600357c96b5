//! Session establishment.
//!
//! Drives the client side of the session handshake over an open transport:
//! `new`, optional transport negotiation, authentication, and finally
//! `established` (or `failed`).

use courier_protocol::{
    Authentication, Compression, Encryption, Envelope, Node, Session, SessionState,
};
use courier_transport::Transport;
use tracing::{debug, trace};

use crate::error::ClientError;
use crate::metrics;

/// Validated credentials for one of the authentication schemes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    identifier: String,
    authentication: Authentication,
}

impl Credentials {
    /// Guest credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] if `identifier` is empty.
    pub fn guest(identifier: &str) -> Result<Self, ClientError> {
        Ok(Self {
            identifier: required(identifier, "identifier is required")?,
            authentication: Authentication::Guest,
        })
    }

    /// Plain password credentials. The password is base64-encoded on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] if `identifier` or `password` is empty.
    pub fn password(identifier: &str, password: &str) -> Result<Self, ClientError> {
        Ok(Self {
            identifier: required(identifier, "identifier is required")?,
            authentication: Authentication::Plain {
                password: required(password, "password is required")?,
            },
        })
    }

    /// Access key credentials. The key is sent as given.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] if `identifier` or `key` is empty.
    pub fn key(identifier: &str, key: &str) -> Result<Self, ClientError> {
        Ok(Self {
            identifier: required(identifier, "identifier is required")?,
            authentication: Authentication::Key {
                key: required(key, "key is required")?,
            },
        })
    }

    /// The identifier to authenticate as.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The authentication payload.
    #[must_use]
    pub fn authentication(&self) -> &Authentication {
        &self.authentication
    }

    /// The node the client presents as, filling in `domain` and `instance`
    /// when the identifier does not carry them.
    #[must_use]
    pub fn node(&self, domain: &str, instance: &str) -> Node {
        let mut node = Node::parse(&self.identifier);
        if node.domain.is_none() {
            node.domain = Some(domain.to_string());
        }
        if node.instance.is_none() && !instance.is_empty() {
            node.instance = Some(instance.to_string());
        }
        node
    }
}

fn required(value: &str, message: &'static str) -> Result<String, ClientError> {
    if value.trim().is_empty() {
        return Err(ClientError::Argument(message));
    }
    Ok(value.to_string())
}

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishedSession {
    /// Session identifier assigned by the hub.
    pub session_id: Option<String>,
    /// The client's own node, as confirmed by the hub.
    pub local_node: Node,
    /// The hub node serving the session.
    pub remote_node: Option<Node>,
}

/// Run the handshake on an open transport.
///
/// # Errors
///
/// Returns [`ClientError::Authentication`] if the hub fails the session or
/// answers out of order, [`ClientError::ConnectionClosed`] if the transport
/// closes mid-handshake, and transport errors as they occur.
pub async fn establish(
    transport: &mut dyn Transport,
    credentials: &Credentials,
    domain: &str,
    instance: &str,
) -> Result<EstablishedSession, ClientError> {
    let from = credentials.node(domain, instance);
    let mut authenticating = false;

    debug!(node = %from, scheme = ?credentials.authentication.scheme(), "Starting session");
    transport
        .send(&Envelope::from(Session::new(SessionState::New)))
        .await?;

    loop {
        let session = match transport.recv().await? {
            Some(Envelope::Session(session)) => session,
            Some(other) => {
                trace!(kind = other.kind().as_str(), "Ignoring envelope during handshake");
                continue;
            }
            None => return Err(ClientError::ConnectionClosed),
        };

        trace!(id = ?session.id, state = ?session.state, "Session envelope");

        match session.state {
            SessionState::Negotiating => {
                if session.compression_options.is_some() || session.encryption_options.is_some() {
                    let compression = choose(
                        session.compression_options.as_deref(),
                        &transport.supported_compression(),
                        Compression::None,
                    );
                    let encryption = choose(
                        session.encryption_options.as_deref(),
                        &transport.supported_encryption(),
                        Encryption::None,
                    );
                    debug!(?compression, ?encryption, "Negotiating transport options");
                    transport
                        .send(&Envelope::from(Session::negotiate(session.id, compression, encryption)))
                        .await?;
                } else {
                    // Hub confirmed the choice.
                    if let Some(compression) = session.compression {
                        transport.set_compression(compression).await?;
                    }
                    if let Some(encryption) = session.encryption {
                        transport.set_encryption(encryption).await?;
                    }
                }
            }
            SessionState::Authenticating => {
                if authenticating {
                    return Err(ClientError::Authentication(
                        "unexpected additional authentication round".into(),
                    ));
                }
                let scheme = credentials.authentication.scheme();
                if let Some(options) = &session.scheme_options {
                    if !options.contains(&scheme) {
                        metrics::record_session("failed");
                        return Err(ClientError::Authentication(format!(
                            "scheme {:?} not offered by the hub",
                            scheme
                        )));
                    }
                }
                authenticating = true;
                let authenticate =
                    Session::authenticate(session.id, from.clone(), &credentials.authentication);
                transport.send(&Envelope::from(authenticate)).await?;
            }
            SessionState::Established => {
                metrics::record_session("established");
                let local_node = session.to.unwrap_or(from);
                debug!(node = %local_node, session = ?session.id, "Session established");
                return Ok(EstablishedSession {
                    session_id: session.id,
                    local_node,
                    remote_node: session.from,
                });
            }
            SessionState::Failed => {
                metrics::record_session("failed");
                let reason = session
                    .reason
                    .map_or_else(|| "session failed".to_string(), |r| r.to_string());
                return Err(ClientError::Authentication(reason));
            }
            other => {
                metrics::record_session("failed");
                return Err(ClientError::Authentication(format!(
                    "unexpected session state {:?}",
                    other
                )));
            }
        }
    }
}

/// Pick the first option offered by the hub that the transport supports.
fn choose<T: Copy + PartialEq>(offered: Option<&[T]>, supported: &[T], fallback: T) -> T {
    offered
        .and_then(|offered| offered.iter().copied().find(|o| supported.contains(o)))
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_protocol::{AuthenticationScheme, Reason};
    use courier_transport::TransportError;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Replays scripted hub envelopes and records what the client sends.
    #[derive(Default)]
    struct ScriptedTransport {
        inbound: VecDeque<Envelope>,
        sent: Vec<Envelope>,
    }

    impl ScriptedTransport {
        fn with(inbound: Vec<Session>) -> Self {
            Self {
                inbound: inbound.into_iter().map(Envelope::from).collect(),
                sent: Vec::new(),
            }
        }

        fn sent_sessions(&self) -> Vec<&Session> {
            self.sent
                .iter()
                .filter_map(|e| match e {
                    Envelope::Session(s) => Some(s),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(&mut self, _uri: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
            self.sent.push(envelope.clone());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
            Ok(self.inbound.pop_front())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn session(state: SessionState) -> Session {
        Session::new(state).with_id(Some("s1".into()))
    }

    #[test]
    fn test_credentials_validation() {
        assert!(matches!(Credentials::guest(""), Err(ClientError::Argument(_))));
        assert!(matches!(Credentials::password("", "123456"), Err(ClientError::Argument(_))));
        assert!(matches!(Credentials::password("test2", ""), Err(ClientError::Argument(_))));
        assert!(matches!(Credentials::key("", "YWJjZGVm"), Err(ClientError::Argument(_))));
        assert!(matches!(Credentials::key("dGVzdHQy", ""), Err(ClientError::Argument(_))));

        assert!(Credentials::guest("guest").is_ok());
        assert!(Credentials::password("test", "123456").is_ok());
        assert!(Credentials::key("testKey", "YWJjZGVm").is_ok());
    }

    #[test]
    fn test_credentials_node() {
        let guest = Credentials::guest("guest").unwrap();
        assert_eq!(guest.node("msging.net", "home").to_string(), "guest@msging.net/home");

        let qualified = Credentials::guest("bot@example.org/worker").unwrap();
        assert_eq!(
            qualified.node("msging.net", "home").to_string(),
            "bot@example.org/worker"
        );
    }

    #[test]
    fn test_choose_option() {
        assert_eq!(
            choose(Some(&[Encryption::Tls, Encryption::None][..]), &[Encryption::None], Encryption::None),
            Encryption::None
        );
        assert_eq!(
            choose(Some(&[Compression::Gzip][..]), &[Compression::None], Compression::None),
            Compression::None
        );
        assert_eq!(choose::<Compression>(None, &[Compression::Gzip], Compression::None), Compression::None);
    }

    #[tokio::test]
    async fn test_guest_handshake_with_negotiation() {
        let mut offer = session(SessionState::Negotiating);
        offer.compression_options = Some(vec![Compression::None]);
        offer.encryption_options = Some(vec![Encryption::None, Encryption::Tls]);

        let mut confirm = session(SessionState::Negotiating);
        confirm.compression = Some(Compression::None);
        confirm.encryption = Some(Encryption::None);

        let mut authenticating = session(SessionState::Authenticating);
        authenticating.scheme_options = Some(vec![AuthenticationScheme::Guest, AuthenticationScheme::Key]);

        let established = Session::established(
            Some("s1".into()),
            Node::parse("postmaster@msging.net/hub"),
            Node::parse("guest@msging.net/home"),
        );

        let mut transport = ScriptedTransport::with(vec![offer, confirm, authenticating, established]);
        let credentials = Credentials::guest("guest").unwrap();

        let result = establish(&mut transport, &credentials, "msging.net", "home")
            .await
            .unwrap();
        assert_eq!(result.session_id.as_deref(), Some("s1"));
        assert_eq!(result.local_node.to_string(), "guest@msging.net/home");
        assert_eq!(
            result.remote_node.map(|n| n.to_string()).as_deref(),
            Some("postmaster@msging.net/hub")
        );

        let sent = transport.sent_sessions();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].state, SessionState::New);
        assert_eq!(sent[1].state, SessionState::Negotiating);
        assert_eq!(sent[1].encryption, Some(Encryption::None));
        assert_eq!(sent[2].state, SessionState::Authenticating);
        assert_eq!(sent[2].scheme, Some(AuthenticationScheme::Guest));
        assert_eq!(sent[2].authentication, Some(json!({})));
    }

    #[tokio::test]
    async fn test_plain_handshake_sends_base64_password() {
        let mut transport = ScriptedTransport::with(vec![
            session(SessionState::Authenticating),
            session(SessionState::Established),
        ]);
        let credentials = Credentials::password("test", "123456").unwrap();

        let result = establish(&mut transport, &credentials, "msging.net", "")
            .await
            .unwrap();
        // No `to` from the hub: fall back to the presented node.
        assert_eq!(result.local_node.to_string(), "test@msging.net");

        let sent = transport.sent_sessions();
        assert_eq!(sent[1].authentication, Some(json!({"password": "MTIzNDU2"})));
    }

    #[tokio::test]
    async fn test_failed_session() {
        let failed = Session::failed(Some("s1".into()), Reason::new(13, "Invalid credentials"));
        let mut transport = ScriptedTransport::with(vec![session(SessionState::Authenticating), failed]);
        let credentials = Credentials::key("test", "bad").unwrap();

        match establish(&mut transport, &credentials, "msging.net", "home").await {
            Err(ClientError::Authentication(reason)) => assert!(reason.contains("Invalid credentials")),
            other => panic!("Expected authentication failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scheme_not_offered() {
        let mut authenticating = session(SessionState::Authenticating);
        authenticating.scheme_options = Some(vec![AuthenticationScheme::Plain]);
        let mut transport = ScriptedTransport::with(vec![authenticating]);

        let credentials = Credentials::guest("guest").unwrap();
        assert!(matches!(
            establish(&mut transport, &credentials, "msging.net", "home").await,
            Err(ClientError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_mid_handshake() {
        let mut transport = ScriptedTransport::with(vec![]);
        let credentials = Credentials::guest("guest").unwrap();
        assert!(matches!(
            establish(&mut transport, &credentials, "msging.net", "home").await,
            Err(ClientError::ConnectionClosed)
        ));
    }
}
