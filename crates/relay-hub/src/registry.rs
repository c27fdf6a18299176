//! Registry of live connections keyed by role and id.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionKind};

type ConnectionMap = RwLock<BTreeMap<String, Arc<Connection>>>;

/// At most one live connection per (role, id).
///
/// Each role has its own map and lock. Locks are never held across an
/// `.await`; callers work on snapshots.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    bots: ConnectionMap,
    workers: ConnectionMap,
    observers: ConnectionMap,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: ConnectionKind) -> &ConnectionMap {
        match kind {
            ConnectionKind::Bot => &self.bots,
            ConnectionKind::Worker => &self.workers,
            ConnectionKind::Observer => &self.observers,
        }
    }

    /// Register `conn` under its role and id.
    ///
    /// A previous connection under the same id is closed before it is
    /// replaced and returned to the caller for bookkeeping.
    pub fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let kind = conn.kind();
        let id = conn.id().to_string();
        let serial = conn.serial();
        let displaced = {
            let mut map = self.map(kind).write();
            let displaced = map.insert(id.clone(), conn);
            if let Some(old) = displaced.as_ref().filter(|old| old.serial() != serial) {
                old.close();
            }
            displaced
        };
        match &displaced {
            Some(old) => info!(
                kind = %kind,
                conn_id = %id,
                old_serial = old.serial(),
                new_serial = serial,
                "connection replaced"
            ),
            None => debug!(kind = %kind, conn_id = %id, serial, "connection registered"),
        }
        displaced
    }

    /// Remove whatever is registered under `id`.
    pub fn unregister(&self, kind: ConnectionKind, id: &str) -> Option<Arc<Connection>> {
        self.map(kind).write().remove(id)
    }

    /// Remove `conn` only if it is still the registered connection for its id.
    pub fn remove_exact(&self, conn: &Connection) -> bool {
        let mut map = self.map(conn.kind()).write();
        match map.get(conn.id()) {
            Some(current) if current.serial() == conn.serial() => {
                let _ = map.remove(conn.id());
                true
            }
            _ => false,
        }
    }

    /// Connections of one role ordered by id.
    pub fn snapshot(&self, kind: ConnectionKind) -> Vec<Arc<Connection>> {
        self.map(kind).read().values().cloned().collect()
    }

    /// Look up a connection.
    pub fn get(&self, kind: ConnectionKind, id: &str) -> Option<Arc<Connection>> {
        self.map(kind).read().get(id).cloned()
    }

    /// Number of connections of one role.
    pub fn len(&self, kind: ConnectionKind) -> usize {
        self.map(kind).read().len()
    }

    /// Whether no connection of any role is registered.
    pub fn is_empty(&self) -> bool {
        [
            ConnectionKind::Bot,
            ConnectionKind::Worker,
            ConnectionKind::Observer,
        ]
        .into_iter()
        .all(|kind| self.len(kind) == 0)
    }
}
