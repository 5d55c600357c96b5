//! Session bootstrap.
//!
//! Once the hub has authenticated the session, the client announces its
//! presence and subscribes to message receipts before it reports itself
//! connected.

use courier_protocol::{media_types, Command, Event};
use serde::{Deserialize, Serialize};

/// Client lifecycle states.
///
/// ```text
/// Disconnected -> Authenticating -> Bootstrapping -> Connected -> Closed
///                        |                |             |
///                        +----------------+-------------+--> Failed -> (connect again)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Disconnected,
    Authenticating,
    Bootstrapping,
    Connected,
    Closed,
    Failed,
}

impl ClientState {
    /// Whether a connect attempt may start from this state.
    #[must_use]
    pub fn can_connect(&self) -> bool {
        matches!(self, ClientState::Disconnected | ClientState::Failed)
    }
}

/// Presence availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Unavailable,
    Available,
    Busy,
    Away,
    Invisible,
}

/// How the hub routes messages addressed to the client's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoutingRule {
    Instance,
    Identity,
    Domain,
    RootDomain,
}

/// The presence resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub status: PresenceStatus,
    pub routing_rule: RoutingRule,
}

/// The receipt resource: which notification events the hub should forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub events: Vec<Event>,
}

/// Events the client subscribes to on connect.
pub const RECEIPT_EVENTS: [Event; 5] = [
    Event::Failed,
    Event::Accepted,
    Event::Dispatched,
    Event::Received,
    Event::Consumed,
];

/// `set /presence` announcing the client as available, routed by identity.
#[must_use]
pub fn presence_command() -> Command {
    let presence = Presence {
        status: PresenceStatus::Available,
        routing_rule: RoutingRule::Identity,
    };
    Command::set("/presence", media_types::PRESENCE, to_resource(&presence))
}

/// `set /receipt` subscribing to [`RECEIPT_EVENTS`].
#[must_use]
pub fn receipt_command() -> Command {
    let receipt = Receipt {
        events: RECEIPT_EVENTS.to_vec(),
    };
    Command::set("/receipt", media_types::RECEIPT, to_resource(&receipt))
}

/// The commands issued after authentication, in order.
#[must_use]
pub fn bootstrap_commands() -> [Command; 2] {
    [presence_command(), receipt_command()]
}

fn to_resource<T: Serialize>(resource: &T) -> serde_json::Value {
    // Plain structs of enums and strings always serialize.
    serde_json::to_value(resource).unwrap_or_default()
}
