//! # courier-testing
//!
//! Test support for Courier clients: an in-process mock hub and tracing
//! setup for tests.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use courier_client::Client;
//! use courier_testing::MockHubServer;
//! use courier_transport::TcpTransport;
//!
//! courier_testing::init_tracing();
//! let hub = MockHubServer::start().await?;
//! let mut observed = hub.observe();
//!
//! let client = Client::new(hub.uri(), TcpTransport::new());
//! client.connect_with_guest("guest")?.await?;
//! ```
//!
//! Set `RUST_LOG=courier=trace` to see every envelope.

pub mod handlers;
pub mod server;

pub use handlers::{HubSession, Outcome, REJECTED_SECRET, UNANSWERED_URI};
pub use server::MockHubServer;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a test-friendly tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `courier=debug`. Safe to call from
/// every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
