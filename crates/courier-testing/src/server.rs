//! The mock hub TCP server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::BytesMut;
use courier_protocol::{codec, Envelope};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::handlers::{HubSession, Outcome};

/// Capacity of the observation channel.
const OBSERVE_CAPACITY: usize = 1024;

struct HubState {
    domain: String,
    /// Established connections, by connection number.
    connections: DashMap<u64, mpsc::UnboundedSender<Envelope>>,
    /// Every envelope a client sends.
    observed: broadcast::Sender<Envelope>,
    next_connection: AtomicU64,
}

/// A messaging hub speaking the envelope protocol over TCP on localhost.
///
/// Answers the session handshake (guest, plain and key authentication;
/// the secret `"invalid"` is rejected), replies `success` to `get /ping`,
/// `set /presence` and `set /receipt`, never answers commands on
/// [`UNANSWERED_URI`](crate::UNANSWERED_URI) and replies `failure` to anything else,
/// answers a `ping` message or notification with `pong`, and echoes every
/// other notification back to its sender.
///
/// The server stops when dropped.
pub struct MockHubServer {
    addr: SocketAddr,
    state: Arc<HubState>,
    task: JoinHandle<()>,
}

impl MockHubServer {
    /// Start a hub for the `msging.net` domain on an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start() -> Result<Self> {
        Self::start_with_domain("msging.net").await
    }

    /// Start a hub for `domain` on an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start_with_domain(domain: &str) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (observed, _) = broadcast::channel(OBSERVE_CAPACITY);

        let state = Arc::new(HubState {
            domain: domain.to_string(),
            connections: DashMap::new(),
            observed,
            next_connection: AtomicU64::new(1),
        });

        info!(%addr, "Mock hub listening");
        let task = tokio::spawn(accept_loop(listener, state.clone()));

        Ok(Self { addr, state, task })
    }

    /// The listening address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The address as a `net.tcp://` URI.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("net.tcp://{}", self.addr)
    }

    /// Subscribe to every envelope clients send from now on.
    #[must_use]
    pub fn observe(&self) -> broadcast::Receiver<Envelope> {
        self.state.observed.subscribe()
    }

    /// Send `envelope` to every established connection.
    ///
    /// Returns the number of connections it was queued for.
    pub fn broadcast(&self, envelope: impl Into<Envelope>) -> usize {
        let envelope = envelope.into();
        let mut count = 0;
        for connection in self.state.connections.iter() {
            if connection.value().send(envelope.clone()).is_ok() {
                count += 1;
            }
        }
        debug!(kind = envelope.kind().as_str(), recipients = count, "Broadcast");
        count
    }

    /// Number of established connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }
}

impl Drop for MockHubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<HubState>) {
    // Dropping the set aborts every connection task.
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = state.next_connection.fetch_add(1, Ordering::Relaxed);
                    debug!(connection = id, %peer, "Connection accepted");
                    let state = state.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, id, &state).await {
                            warn!(connection = id, error = %e, "Connection error");
                        }
                        state.connections.remove(&id);
                        debug!(connection = id, "Connection closed");
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            Some(_) = connections.join_next() => {}
        }
    }
}

async fn handle_connection(stream: TcpStream, id: u64, state: &HubState) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = HubSession::new(&state.domain);
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            Some(envelope) = rx.recv() => write_envelope(&mut writer, &envelope).await?,

            read = reader.read_buf(&mut read_buffer) => {
                if read? == 0 {
                    return Ok(());
                }
                while let Some(envelope) = next_envelope(&mut read_buffer, id) {
                    let _ = state.observed.send(envelope.clone());
                    let Outcome { replies, established, close } = session.handle(envelope);

                    if established {
                        state.connections.insert(id, tx.clone());
                    }
                    for reply in &replies {
                        write_envelope(&mut writer, reply).await?;
                    }
                    if close {
                        writer.shutdown().await?;
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Decode the next buffered envelope, skipping ones that do not classify.
fn next_envelope(buffer: &mut BytesMut, connection: u64) -> Option<Envelope> {
    loop {
        match codec::decode_from(buffer) {
            Ok(next) => return next,
            Err(e) if e.is_recoverable() => {
                warn!(connection, error = %e, "Skipping invalid envelope");
            }
            Err(e) => {
                warn!(connection, error = %e, "Discarding unreadable input");
                return None;
            }
        }
    }
}

async fn write_envelope(writer: &mut OwnedWriteHalf, envelope: &Envelope) -> Result<()> {
    let data = codec::encode(envelope)?;
    writer.write_all(&data).await?;
    Ok(())
}
