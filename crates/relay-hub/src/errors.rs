//! Hub error types.

use std::time::Duration;

use relay_core::CodecError;

use crate::connection::ConnectionKind;
use crate::events::DisconnectReason;

/// Failure writing to a connection's frame sink.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection was already closed.
    #[error("connection closed")]
    Closed,
    /// The underlying socket rejected the write.
    #[error("write failed: {0}")]
    Write(String),
    /// The write did not complete before the deadline.
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors surfaced by hub operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The connection owning an outstanding request went away.
    #[error("connection {id} lost: {reason}")]
    ConnectionLost {
        /// Connection id.
        id: String,
        /// Why it went away.
        reason: DisconnectReason,
    },
    /// No live connection accepted the payload.
    #[error("no target available for {routing_key}")]
    NoTargetAvailable {
        /// Key the payload was routed by.
        routing_key: String,
    },
    /// No reply arrived before the deadline.
    #[error("no reply for {token} within {deadline:?}")]
    CorrelationTimeout {
        /// Correlation token.
        token: String,
        /// Deadline that elapsed.
        deadline: Duration,
    },
    /// Lookup of a connection that is not registered.
    #[error("unknown {kind} connection {id}")]
    UnknownConnection {
        /// Connection role.
        kind: ConnectionKind,
        /// Connection id.
        id: String,
    },
    /// Encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The routing rule store failed.
    #[error("rule store: {0}")]
    RuleStore(String),
}

impl HubError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectionLost { .. } => "connection_lost",
            Self::NoTargetAvailable { .. } => "no_target_available",
            Self::CorrelationTimeout { .. } => "correlation_timeout",
            Self::UnknownConnection { .. } => "unknown_connection",
            Self::Codec(_) => "codec",
            Self::RuleStore(_) => "rule_store",
        }
    }
}
