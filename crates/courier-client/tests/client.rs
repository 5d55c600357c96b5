//! End-to-end tests against the mock hub over TCP.

use std::future::Future;
use std::time::Duration;

use courier_client::{Client, ClientError, ClientState, Predicate};
use courier_protocol::{
    media_types, Command, CommandStatus, Envelope, Event, Message, Method, Notification,
    SessionState,
};
use courier_testing::{MockHubServer, REJECTED_SECRET, UNANSWERED_URI};
use courier_transport::TcpTransport;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(5);

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting")
}

async fn start_hub() -> MockHubServer {
    courier_testing::init_tracing();
    MockHubServer::start().await.unwrap()
}

fn client_for(hub: &MockHubServer) -> Client {
    Client::new(hub.uri(), TcpTransport::new())
}

async fn connected(hub: &MockHubServer) -> Client {
    let client = client_for(hub);
    within(client.connect_with_key("test", "YWJjZGVm").unwrap())
        .await
        .unwrap();
    client
}

/// Wait for the next envelope the hub observes that satisfies `matcher`.
async fn observed<T>(
    observer: &mut broadcast::Receiver<Envelope>,
    mut matcher: impl FnMut(Envelope) -> Option<T>,
) -> T {
    within(async {
        loop {
            if let Some(found) = matcher(observer.recv().await.unwrap()) {
                return found;
            }
        }
    })
    .await
}

fn as_command(envelope: Envelope) -> Option<Command> {
    match envelope {
        Envelope::Command(command) if !command.is_response() => Some(command),
        _ => None,
    }
}

fn as_notification(envelope: Envelope) -> Option<Notification> {
    match envelope {
        Envelope::Notification(notification) => Some(notification),
        _ => None,
    }
}

#[tokio::test]
async fn test_connect_with_guest() {
    let hub = start_hub().await;
    let client = client_for(&hub);

    within(client.connect_with_guest("guest").unwrap())
        .await
        .unwrap();

    assert_eq!(client.state(), ClientState::Connected);
    let node = client.local_node().unwrap();
    assert_eq!(node.name.as_deref(), Some("guest"));
    assert_eq!(node.domain.as_deref(), Some("msging.net"));
    assert_eq!(hub.connection_count(), 1);
}

#[tokio::test]
async fn test_connect_with_password() {
    let hub = start_hub().await;
    let client = client_for(&hub);

    within(client.connect_with_password("test", "123456").unwrap())
        .await
        .unwrap();
    assert_eq!(client.state(), ClientState::Connected);
}

#[tokio::test]
async fn test_rejected_credentials() {
    let hub = start_hub().await;
    let client = client_for(&hub);

    let result = within(client.connect_with_password("test", REJECTED_SECRET).unwrap()).await;
    match result {
        Err(ClientError::Authentication(reason)) => assert!(reason.contains("Invalid credentials")),
        other => panic!("Expected authentication failure, got {:?}", other),
    }
    assert_eq!(client.state(), ClientState::Failed);

    // A failed client may connect again.
    within(client.connect_with_key("test", "YWJjZGVm").unwrap())
        .await
        .unwrap();
    assert_eq!(client.state(), ClientState::Connected);
}

#[tokio::test]
async fn test_argument_errors_do_no_io() {
    let hub = start_hub().await;
    let mut observer = hub.observe();
    let client = client_for(&hub);

    assert!(matches!(client.connect_with_guest(""), Err(ClientError::Argument(_))));
    assert!(matches!(client.connect_with_password("", "123456"), Err(ClientError::Argument(_))));
    assert!(matches!(client.connect_with_password("test2", ""), Err(ClientError::Argument(_))));
    assert!(matches!(client.connect_with_key("", "YWJjZGVm"), Err(ClientError::Argument(_))));
    assert!(matches!(client.connect_with_key("dGVzdHQy", ""), Err(ClientError::Argument(_))));

    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(matches!(
        observer.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_bootstrap_commands() {
    let hub = start_hub().await;
    let mut observer = hub.observe();
    let _client = connected(&hub).await;

    let presence = observed(&mut observer, as_command).await;
    assert_eq!(presence.method, Method::Set);
    assert_eq!(presence.uri.as_deref(), Some("/presence"));
    assert_eq!(presence.resource_type.as_deref(), Some(media_types::PRESENCE));
    assert_eq!(
        presence.resource,
        Some(json!({"status": "available", "routingRule": "identity"}))
    );

    let receipt = observed(&mut observer, as_command).await;
    assert_eq!(receipt.method, Method::Set);
    assert_eq!(receipt.uri.as_deref(), Some("/receipt"));
    assert_eq!(receipt.resource_type.as_deref(), Some(media_types::RECEIPT));
    assert_eq!(
        receipt.resource,
        Some(json!({"events": ["failed", "accepted", "dispatched", "received", "consumed"]}))
    );
}

#[tokio::test]
async fn test_send_command_success() {
    let hub = start_hub().await;
    let client = connected(&hub).await;

    let response = within(client.send_command(Command::get("/ping").with_id("test")))
        .await
        .unwrap();

    assert_eq!(response.id.as_deref(), Some("test"));
    assert_eq!(response.method, Method::Get);
    assert_eq!(response.status, Some(CommandStatus::Success));
}

#[tokio::test]
async fn test_send_command_failure() {
    let hub = start_hub().await;
    let client = connected(&hub).await;

    let result = within(client.send_command(Command::new(Method::Set, "/unknown").with_id("test"))).await;

    match result {
        Err(ClientError::CommandFailed(response)) => {
            assert_eq!(response.id.as_deref(), Some("test"));
            assert_eq!(response.status, Some(CommandStatus::Failure));
        }
        other => panic!("Expected CommandFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_commands_get_generated_ids() {
    let hub = start_hub().await;
    let client = connected(&hub).await;

    let first = within(client.send_command(Command::get("/ping"))).await.unwrap();
    let second = within(client.send_command(Command::get("/ping"))).await.unwrap();
    assert!(first.id.is_some());
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn test_failing_receiver_sends_failed_notification() {
    let hub = start_hub().await;
    let client = connected(&hub).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    client.add_message_receiver(Predicate::Always, |_: &Message| Err("test error".into()));
    client.add_notification_receiver(Event::Failed, move |n: &Notification| {
        let _ = tx.send(n.clone());
        Ok(())
    });

    hub.broadcast(Message::text("test"));

    // The hub echoes notifications back.
    let failed = within(rx.recv()).await.unwrap();
    let reason = failed.reason.unwrap();
    assert_eq!(reason.code, 101);
    assert_eq!(reason.description.as_deref(), Some("test error"));
}

#[tokio::test]
async fn test_received_then_consumed() {
    let hub = start_hub().await;
    let mut observer = hub.observe();
    let client = connected(&hub).await;

    client.add_message_receiver(Predicate::custom(|_: &Message| true), |_: &Message| Ok(()));
    hub.broadcast(Message::text("test").with_id("m1"));

    let received = observed(&mut observer, as_notification).await;
    assert_eq!(received.event, Event::Received);
    assert_eq!(received.id.as_deref(), Some("m1"));

    let consumed = observed(&mut observer, as_notification).await;
    assert_eq!(consumed.event, Event::Consumed);
    assert_eq!(consumed.id.as_deref(), Some("m1"));
}

#[tokio::test]
async fn test_unmatched_message_only_received() {
    let hub = start_hub().await;
    let mut observer = hub.observe();
    let client = connected(&hub).await;

    client.add_message_receiver("sometype", |_: &Message| Ok(()));
    hub.broadcast(Message::new("application/unknown", "this looks odd").with_id("m1"));
    hub.broadcast(Message::new("sometype", "fine").with_id("m2"));

    let events: Vec<(Event, Option<String>)> = within(async {
        let mut events = Vec::new();
        while events.len() < 3 {
            if let Some(n) = as_notification(observer.recv().await.unwrap()) {
                events.push((n.event, n.id));
            }
        }
        events
    })
    .await;

    assert_eq!(
        events,
        vec![
            (Event::Received, Some("m1".to_string())),
            (Event::Received, Some("m2".to_string())),
            (Event::Consumed, Some("m2".to_string())),
        ]
    );
}

#[tokio::test]
async fn test_predicates_see_the_envelope() {
    let hub = start_hub().await;
    let client = connected(&hub).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let messages = tx.clone();
    client.add_message_receiver(
        Predicate::custom(|m: &Message| m.content_type == "text/plain" && m.content == json!("test")),
        move |m: &Message| {
            let _ = messages.send(Envelope::from(m.clone()));
            Ok(())
        },
    );
    client.add_notification_receiver(
        Predicate::custom(|n: &Notification| n.event == Event::Dispatched),
        move |n: &Notification| {
            let _ = tx.send(Envelope::from(n.clone()));
            Ok(())
        },
    );

    hub.broadcast(Message::text("other"));
    hub.broadcast(Message::text("test"));
    hub.broadcast(Notification::new(Event::Dispatched));

    assert!(matches!(within(rx.recv()).await, Some(Envelope::Message(m)) if m.content == json!("test")));
    assert!(matches!(
        within(rx.recv()).await,
        Some(Envelope::Notification(n)) if n.event == Event::Dispatched
    ));
}

#[tokio::test]
async fn test_first_matching_receiver_wins_and_removal() {
    let hub = start_hub().await;
    let client = connected(&hub).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let first_tx = tx.clone();
    let first = client.add_message_receiver("text/plain", move |_: &Message| {
        let _ = first_tx.send("first");
        Ok(())
    });
    client.add_message_receiver("text/plain", move |_: &Message| {
        let _ = tx.send("second");
        Ok(())
    });

    hub.broadcast(Message::text("one"));
    assert_eq!(within(rx.recv()).await, Some("first"));

    first.remove();
    first.remove();
    hub.broadcast(Message::text("two"));
    assert_eq!(within(rx.recv()).await, Some("second"));

    client.clear_message_receivers();
    client.clear_message_receivers();
    hub.broadcast(Message::text("three"));
    // Round-trip a command so the broadcast has been processed.
    within(client.send_command(Command::get("/ping"))).await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unknown_envelopes_are_ignored() {
    let hub = start_hub().await;
    let client = connected(&hub).await;

    client.add_message_receiver("sometype", |_: &Message| Ok(()));
    client.add_notification_receiver("sometype", |_: &Notification| Ok(()));

    hub.broadcast(Message::new("application/unknown", "this looks odd"));
    hub.broadcast(Notification::new(Event::Consumed));
    let request: Envelope = serde_json::from_value(json!({"id": "no_id_for_this", "method": "get"})).unwrap();
    hub.broadcast(request);

    let response = within(client.send_command(Command::get("/ping"))).await.unwrap();
    assert_eq!(response.status, Some(CommandStatus::Success));
    assert_eq!(client.state(), ClientState::Connected);
}

#[tokio::test]
async fn test_send_message() {
    let hub = start_hub().await;
    let client = connected(&hub).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let token = client.add_message_receiver("text/plain", move |m: &Message| {
        let _ = tx.send(m.content.clone());
        Ok(())
    });
    client.send_message(Message::text("ping")).unwrap();

    assert_eq!(within(rx.recv()).await, Some(json!("pong")));
    token.remove();
}

#[tokio::test]
async fn test_send_notification() {
    let hub = start_hub().await;
    let client = connected(&hub).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    client.add_notification_receiver("pong", move |n: &Notification| {
        let _ = tx.send(n.event.clone());
        Ok(())
    });
    client.send_notification(Notification::new("ping")).unwrap();

    assert_eq!(within(rx.recv()).await, Some(Event::from("pong")));
}

#[tokio::test]
async fn test_handler_can_use_client() {
    let hub = start_hub().await;
    let client = connected(&hub).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = client.clone();
    client.add_message_receiver("text/plain", move |m: &Message| {
        if m.content == json!("test") {
            handle.send_message(Message::text("ping"))?;
        } else {
            let _ = tx.send(m.content.clone());
        }
        Ok(())
    });

    hub.broadcast(Message::text("test"));
    assert_eq!(within(rx.recv()).await, Some(json!("pong")));
}

#[tokio::test]
async fn test_close() {
    let hub = start_hub().await;
    let mut observer = hub.observe();
    let client = connected(&hub).await;

    within(client.close()).await.unwrap();
    assert_eq!(client.state(), ClientState::Closed);

    let finishing = observed(&mut observer, |e| match e {
        Envelope::Session(s) if s.state == SessionState::Finishing => Some(s),
        _ => None,
    })
    .await;
    assert_eq!(finishing.state, SessionState::Finishing);

    within(client.close()).await.unwrap();
    assert!(matches!(
        client.send_command(Command::get("/ping")).await,
        Err(ClientError::InvalidState { .. })
    ));
    assert!(matches!(
        client.send_message(Message::text("late")),
        Err(ClientError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_close_rejects_pending_command() {
    let hub = start_hub().await;
    let mut observer = hub.observe();
    let client = connected(&hub).await;

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.send_command(Command::get(UNANSWERED_URI).with_id("test")).await }
    });

    // Close only once the command is on the wire.
    observed(&mut observer, |e| {
        as_command(e).filter(|c| c.uri.as_deref() == Some(UNANSWERED_URI))
    })
    .await;
    assert!(!pending.is_finished());

    within(client.close()).await.unwrap();
    let result = within(pending).await.unwrap();
    assert!(matches!(result, Err(ClientError::ConnectionClosed)), "got {:?}", result);
}

#[tokio::test]
async fn test_hub_shutdown_fails_client() {
    let hub = start_hub().await;
    let client = connected(&hub).await;

    drop(hub);
    within(client.wait_for_state(ClientState::Failed)).await.unwrap();
}
