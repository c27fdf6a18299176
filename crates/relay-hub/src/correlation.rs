//! Request/response correlation over the asynchronous socket transport.
//!
//! Every outbound call registers its token here before the frame is written.
//! The waiter holds a [`PendingReply`] whose drop removes the entry, so a
//! token is cleaned up on reply, deadline, cancellation or early return.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use relay_core::{ActionResponse, CorrelationToken};
use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::HubError;
use crate::events::DisconnectReason;

type Reply = Result<ActionResponse, HubError>;

struct Pending {
    tx: oneshot::Sender<Reply>,
    owner: u64,
    issued_at: DateTime<Utc>,
}

type PendingMap = Arc<RwLock<HashMap<String, Pending>>>;

/// Map of outstanding correlation tokens.
#[derive(Clone, Default)]
pub struct CorrelationBridge {
    pending: PendingMap,
}

impl CorrelationBridge {
    /// Empty bridge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token`, owned by the connection with serial `owner`.
    pub fn register(
        &self,
        token: CorrelationToken,
        owner: u64,
        issued_at: DateTime<Utc>,
    ) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let key = token.as_str().to_string();
        let _ = self.pending.write().insert(
            key,
            Pending {
                tx,
                owner,
                issued_at,
            },
        );
        PendingReply {
            token,
            rx,
            pending: Arc::clone(&self.pending),
        }
    }

    /// Deliver `reply` to the waiter for `token`. Unknown or expired tokens
    /// are discarded.
    pub fn resolve(&self, token: &str, reply: ActionResponse) -> bool {
        let pending = self.pending.upgradable_read();
        if !pending.contains_key(token) {
            debug!(token, "discarding reply for unknown token");
            return false;
        }
        let mut pending = RwLockUpgradableReadGuard::upgrade(pending);
        let Some(entry) = pending.remove(token) else {
            return false;
        };
        drop(pending);
        entry.tx.send(Ok(reply)).is_ok()
    }

    /// Drop `token` without delivering anything.
    pub fn expire(&self, token: &str) -> bool {
        self.pending.write().remove(token).is_some()
    }

    /// Fail every request owned by `owner` with `ConnectionLost`. Returns the
    /// number of waiters notified.
    pub fn fail_owner(&self, owner: u64, id: &str, reason: DisconnectReason) -> usize {
        let failed: Vec<(String, Pending)> = {
            let mut pending = self.pending.write();
            let tokens: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.owner == owner)
                .map(|(t, _)| t.clone())
                .collect();
            tokens
                .into_iter()
                .filter_map(|t| pending.remove(&t).map(|p| (t, p)))
                .collect()
        };
        let count = failed.len();
        for (token, entry) in failed {
            debug!(token, conn_id = id, %reason, "failing pending request");
            let _ = entry.tx.send(Err(HubError::ConnectionLost {
                id: id.to_string(),
                reason,
            }));
        }
        count
    }

    /// Number of outstanding tokens.
    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    /// Issue time of the oldest outstanding token.
    pub fn oldest_issued_at(&self) -> Option<DateTime<Utc>> {
        self.pending.read().values().map(|p| p.issued_at).min()
    }
}

/// Waiter side of a registered token.
pub struct PendingReply {
    token: CorrelationToken,
    rx: oneshot::Receiver<Reply>,
    pending: PendingMap,
}

impl PendingReply {
    /// The registered token.
    pub fn token(&self) -> &CorrelationToken {
        &self.token
    }

    /// Wait for the reply or the deadline, whichever comes first.
    pub async fn wait(mut self, deadline: Duration) -> Result<ActionResponse, HubError> {
        let timed_out = || HubError::CorrelationTimeout {
            token: self.token.as_str().to_string(),
            deadline,
        };
        match tokio::time::timeout(deadline, &mut self.rx).await {
            Ok(Ok(reply)) => reply,
            // Sender dropped by `expire`.
            Ok(Err(_)) | Err(_) => Err(timed_out()),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let _ = self.pending.write().remove(self.token.as_str());
    }
}
