//! Broadcast events and disconnect bookkeeping.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::connection::ConnectionKind;

/// Why a connection left the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// No heartbeat within the liveness window.
    HeartbeatTimeout,
    /// The read half failed.
    ReadError,
    /// A write to the connection failed.
    WriteError,
    /// A new connection registered under the same id.
    Replaced,
    /// The peer closed the socket.
    Closed,
    /// Removed by an administrative call.
    Unregistered,
}

impl DisconnectReason {
    /// Stable snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ReadError => "read_error",
            Self::WriteError => "write_error",
            Self::Replaced => "replaced",
            Self::Closed => "closed",
            Self::Unregistered => "unregistered",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One connection departure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DisconnectRecord {
    /// Connection role.
    pub kind: ConnectionKind,
    /// Connection id.
    pub id: String,
    /// Per-session serial.
    pub serial: u64,
    /// Why it left.
    pub reason: DisconnectReason,
    /// Time between connect and departure, in milliseconds.
    pub lifetime_ms: i64,
    /// When the departure was observed.
    pub at: DateTime<Utc>,
}

/// Bounded ring of recent [`DisconnectRecord`]s.
#[derive(Debug)]
pub struct DisconnectLog {
    records: Mutex<VecDeque<DisconnectRecord>>,
    capacity: usize,
}

impl DisconnectLog {
    /// Log holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Append a record, dropping the oldest when full.
    pub fn push(&self, record: DisconnectRecord) {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            let _ = records.pop_front();
        }
        records.push_back(record);
    }

    /// Up to `limit` most recent records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<DisconnectRecord> {
        let records = self.records.lock();
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).cloned().collect()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Payload pushed to observers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    /// A bot, worker or observer registered.
    ConnectionOpened {
        /// Connection role.
        kind: ConnectionKind,
        /// Connection id.
        id: String,
        /// Bot platform, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
    },
    /// A connection left the registry.
    ConnectionClosed {
        /// Connection role.
        kind: ConnectionKind,
        /// Connection id.
        id: String,
        /// Why it left.
        reason: DisconnectReason,
    },
    /// The routing table was reloaded.
    RulesChanged {
        /// Number of rules now active.
        count: usize,
    },
    /// Application-defined event.
    Custom {
        /// Event name.
        name: String,
        /// Event payload.
        data: Value,
    },
}
