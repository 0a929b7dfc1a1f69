//! WebSocket server relaying collaboration events between clients.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── outbox A ──► Client A
//!            ├── connection tasks ──► Broadcaster ──┤
//! Client B ──┘        (dispatch)     (RoomRegistry) └── outbox B ──► Client B
//! ```
//!
//! Each connection runs in its own task which `select!`s between:
//! - inbound WebSocket frames (decoded and dispatched to the broadcaster)
//! - its outbox (frames relayed by other connections, written in order)
//! - a heartbeat ticker (WebSocket ping)
//! - the server shutdown signal
//!
//! Every write to a peer races the shutdown signal and is bounded by
//! [`WRITE_TIMEOUT`], so a peer that stops reading cannot hold up shutdown.
//! Tasks still running after [`SHUTDOWN_GRACE`] are aborted.
//!
//! The first frame sent on every connection is the `connected` handshake
//! carrying the connection id, which is also the connection's chat channel.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::Broadcaster;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::room::ConnectionId;
use crate::transport::{Frame, OutboxTransport};

/// Upper bound on the WebSocket upgrade of a freshly accepted socket.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on writing one frame to a peer.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a departing peer gets to take its close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long shutdown waits for connection tasks before aborting them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before deliveries to it are dropped
    pub outbox_capacity: usize,
    /// WebSocket ping interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbox_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("WebSocket handshake timed out")]
    HandshakeTimeout,
    #[error("Write to peer timed out")]
    WriteTimeout,
}

/// Delay before retrying a failed `accept`, doubling up to a ceiling.
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    const FLOOR: Duration = Duration::from_millis(5);
    const CEILING: Duration = Duration::from_secs(1);

    fn new() -> Self {
        Self { next: Self::FLOOR }
    }

    fn failed(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(Self::CEILING);
        delay
    }

    fn reset(&mut self) {
        self.next = Self::FLOOR;
    }
}

enum WriteOutcome {
    Sent,
    Stopped,
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub decode_failures: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct ServerCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    decode_failures: AtomicU64,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    broadcaster: Arc<Broadcaster<OutboxTransport>>,
    counters: Arc<ServerCounters>,
}

impl CollabServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let transport = OutboxTransport::new(config.outbox_capacity);
        Self {
            config,
            broadcaster: Arc::new(Broadcaster::new(transport)),
            counters: Arc::new(ServerCounters::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind the configured address and serve until `shutdown` completes.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` completes.
    ///
    /// On shutdown the listener is dropped, every live connection is sent a
    /// close frame, and the room registry is cleared. Connections that have
    /// not finished within [`SHUTDOWN_GRACE`] are aborted.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        let mut backoff = AcceptBackoff::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        backoff.reset();
                        log::debug!("New TCP connection from {addr}");
                        let broadcaster = self.broadcaster.clone();
                        let counters = self.counters.clone();
                        let heartbeat = self.config.heartbeat();
                        let stop = stop_rx.clone();
                        connections.spawn(async move {
                            if let Err(e) = Self::handle_connection(
                                stream, addr, broadcaster, counters, heartbeat, stop,
                            )
                            .await
                            {
                                log::error!("Connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        let delay = backoff.failed();
                        log::warn!("Failed to accept connection: {e}, retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                },

                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("Connection task failed: {e}");
                    }
                }
            }
        }

        log::info!("Shutting down, closing {} connections", connections.len());
        drop(listener);
        let _ = stop_tx.send(true);

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!(
                "Aborting {} connections still open after {SHUTDOWN_GRACE:?}",
                connections.len()
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
            // Aborted tasks skip their own cleanup.
            self.broadcaster.transport().detach_all();
            self.counters.active_connections.store(0, Ordering::Relaxed);
        }

        self.broadcaster.shutdown().await;
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        broadcaster: Arc<Broadcaster<OutboxTransport>>,
        counters: Arc<ServerCounters>,
        heartbeat: Option<Duration>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let upgrade = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream));
        let ws_stream = tokio::select! {
            upgraded = upgrade => upgraded.map_err(|_| ServerError::HandshakeTimeout)??,
            _ = stop.changed() => {
                log::debug!("Dropping {addr} before upgrade: server stopping");
                return Ok(());
            }
        };

        let connection_id = ConnectionId::random();
        let outbox = broadcaster.transport().attach(connection_id.clone());
        broadcaster.connect(&connection_id).await;
        counters.total_connections.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Connection {connection_id} established from {addr}");

        let result = Self::pump(
            ws_stream,
            &connection_id,
            outbox,
            &broadcaster,
            &counters,
            heartbeat,
            stop,
        )
        .await;

        // Cleanup runs whatever ended the connection. The counter drops
        // first so it never lags behind the registry.
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        broadcaster.disconnect(&connection_id).await;
        broadcaster.transport().detach(&connection_id);
        log::info!("Connection {connection_id} from {addr} closed");

        result
    }

    async fn pump(
        ws_stream: WebSocketStream<TcpStream>,
        connection_id: &ConnectionId,
        mut outbox: mpsc::Receiver<Frame>,
        broadcaster: &Broadcaster<OutboxTransport>,
        counters: &ServerCounters,
        heartbeat: Option<Duration>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let hello = ServerMessage::connected(connection_id).encode()?;
        if let WriteOutcome::Stopped =
            Self::write_frame(&mut ws_sender, Message::text(hello), &mut stop).await?
        {
            return Ok(());
        }

        let mut ticker: Option<Interval> =
            heartbeat.map(|period| interval_at(Instant::now() + period, period));

        loop {
            let outbound = tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        counters.messages_received.fetch_add(1, Ordering::Relaxed);
                        counters
                            .bytes_received
                            .fetch_add(text.len() as u64, Ordering::Relaxed);

                        match ClientMessage::decode(text.as_str()) {
                            Ok(message) => {
                                broadcaster.dispatch(connection_id, message).await;
                            }
                            Err(e) => {
                                counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                                log::warn!("Ignoring malformed frame from {connection_id}: {e}");
                            }
                        }
                        continue;
                    }

                    Some(Ok(Message::Binary(data))) => {
                        log::debug!("Ignoring {} byte binary frame from {connection_id}", data.len());
                        continue;
                    }

                    Some(Ok(Message::Ping(data))) => Message::Pong(data),

                    Some(Ok(Message::Close(_))) | None => return Ok(()),

                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {connection_id}: {e}");
                        return Ok(());
                    }

                    _ => continue,
                },

                // Frames relayed by other connections
                frame = outbox.recv() => match frame {
                    Some(frame) => Message::text(frame.to_string()),
                    None => return Ok(()),
                },

                _ = next_tick(&mut ticker) => Message::Ping(Vec::<u8>::new().into()),

                _ = stop.changed() => break,
            };

            if let WriteOutcome::Stopped =
                Self::write_frame(&mut ws_sender, outbound, &mut stop).await?
            {
                break;
            }
        }

        // Stopping: the close frame is best effort.
        if tokio::time::timeout(CLOSE_TIMEOUT, ws_sender.send(Message::Close(None)))
            .await
            .is_err()
        {
            log::debug!("Close frame to {connection_id} timed out");
        }
        Ok(())
    }

    /// Write one frame, giving up after [`WRITE_TIMEOUT`] or once the server
    /// starts stopping.
    async fn write_frame(
        ws_sender: &mut WsSink,
        message: Message,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<WriteOutcome, ServerError> {
        tokio::select! {
            sent = tokio::time::timeout(WRITE_TIMEOUT, ws_sender.send(message)) => {
                sent.map_err(|_| ServerError::WriteTimeout)??;
                Ok(WriteOutcome::Sent)
            }
            _ = stop.changed() => Ok(WriteOutcome::Stopped),
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
            active_rooms: self.broadcaster.room_count().await,
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The broadcaster shared by all connections.
    pub fn broadcaster(&self) -> &Arc<Broadcaster<OutboxTransport>> {
        &self.broadcaster
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
