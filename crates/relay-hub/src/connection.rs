//! Live bot, worker and observer connections.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use relay_core::Dialect;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::errors::TransportError;

/// Write half of a connection's socket.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    /// Send a ping frame.
    async fn send_ping(&mut self) -> Result<(), TransportError>;
    /// Send a close frame and flush.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Connection role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Platform connector.
    Bot,
    /// Back-end business logic process.
    Worker,
    /// Broadcast-only subscriber.
    Observer,
}

impl ConnectionKind {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::Worker => "worker",
            Self::Observer => "observer",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Function a worker advertises.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Capability name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Parameter schema.
    #[serde(default)]
    pub parameters: Value,
}

/// Write deadline used until the hub sets one from its config.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A registered connection.
///
/// Writes are serialised by an async mutex around the sink. Each write,
/// including the wait for the mutex, is bounded by the write timeout. The
/// close signal is a [`CancellationToken`] observed by the connection's read
/// loop.
pub struct Connection {
    id: String,
    serial: u64,
    kind: ConnectionKind,
    platform: Option<String>,
    dialect: Dialect,
    capabilities: RwLock<Vec<Capability>>,
    sink: AsyncMutex<Box<dyn FrameSink>>,
    write_timeout: Duration,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection around `sink`.
    pub fn new(
        kind: ConnectionKind,
        id: impl Into<String>,
        serial: u64,
        sink: Box<dyn FrameSink>,
        connected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            serial,
            kind,
            platform: None,
            dialect: Dialect::default(),
            capabilities: RwLock::new(Vec::new()),
            sink: AsyncMutex::new(sink),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            cancel: CancellationToken::new(),
            connected_at,
            last_heartbeat: Mutex::new(None),
        }
    }

    /// Set the bot platform.
    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Set the wire dialect used for outbound frames.
    #[must_use]
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Set the per-write deadline.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the initial capability list.
    #[must_use]
    pub fn with_capabilities(self, capabilities: Vec<Capability>) -> Self {
        *self.capabilities.write() = capabilities;
        self
    }

    /// Connection id (bot self id, worker id or observer id).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Unique per-session serial.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Role.
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Bot platform.
    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    /// Outbound wire dialect.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Advertised capabilities.
    pub fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.read().clone()
    }

    /// Replace the advertised capabilities.
    pub fn set_capabilities(&self, capabilities: Vec<Capability>) {
        *self.capabilities.write() = capabilities;
    }

    /// When the connection registered.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Last heartbeat, if any was seen.
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self.last_heartbeat.lock()
    }

    /// Last heartbeat, falling back to the connect time.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat().unwrap_or(self.connected_at)
    }

    /// Record a heartbeat.
    pub fn touch(&self, now: DateTime<Utc>) {
        *self.last_heartbeat.lock() = Some(now);
    }

    /// Fire the close signal. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the close signal has fired.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the close signal fires.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Per-write deadline.
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    async fn bounded<F>(&self, write: F) -> Result<(), TransportError>
    where
        F: Future<Output = Result<(), TransportError>>,
    {
        tokio::time::timeout(self.write_timeout, write)
            .await
            .unwrap_or_else(|_| Err(TransportError::Timeout(self.write_timeout)))
    }

    /// Write a text frame. Fails without touching the socket once closed.
    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.bounded(async { self.sink.lock().await.send_text(text).await })
            .await
    }

    /// Write a ping frame.
    pub async fn ping(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.bounded(async { self.sink.lock().await.send_ping().await })
            .await
    }

    /// Send a close frame on the socket. Used by the read loop on exit.
    pub async fn close_sink(&self) {
        let _ = self
            .bounded(async { self.sink.lock().await.close().await })
            .await;
    }

    /// Serializable snapshot.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            kind: self.kind,
            id: self.id.clone(),
            serial: self.serial,
            platform: self.platform.clone(),
            dialect: self.dialect,
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat(),
            capabilities: self.capabilities(),
        }
    }
}

/// Snapshot of a connection for listings.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Role.
    pub kind: ConnectionKind,
    /// Connection id.
    pub id: String,
    /// Per-session serial.
    pub serial: u64,
    /// Bot platform.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Outbound wire dialect.
    pub dialect: Dialect,
    /// When the connection registered.
    pub connected_at: DateTime<Utc>,
    /// Last heartbeat.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Advertised capabilities.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<Capability>,
}
