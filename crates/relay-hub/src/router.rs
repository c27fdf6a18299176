//! Candidate ordering for worker dispatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::connection::Connection;

/// Picks the order in which workers are tried for one payload.
///
/// The first candidate is the rule target when it is live, otherwise the
/// next worker under a rotating cursor. The remaining workers follow in
/// snapshot order, starting after the first candidate, so each live worker
/// is tried at most once.
#[derive(Debug, Default)]
pub struct Router {
    cursor: AtomicUsize,
}

impl Router {
    /// Router with the cursor at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Order `workers` (an id-ordered snapshot) for delivery.
    pub fn candidates(
        &self,
        rule_target: Option<&str>,
        workers: &[Arc<Connection>],
    ) -> Vec<Arc<Connection>> {
        let len = workers.len();
        if len == 0 {
            return Vec::new();
        }
        let start = rule_target
            .and_then(|target| workers.iter().position(|w| w.id() == target))
            .unwrap_or_else(|| self.cursor.fetch_add(1, Ordering::Relaxed) % len);
        (0..len)
            .map(|offset| Arc::clone(&workers[(start + offset) % len]))
            .collect()
    }
}
