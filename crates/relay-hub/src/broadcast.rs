//! Event fan-out to observer connections.

use std::sync::Arc;

use metrics::counter;
use relay_telemetry::metrics::{BROADCAST_DELIVERIES_TOTAL, BROADCAST_EVICTIONS_TOTAL};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionKind};
use crate::events::HubEvent;
use crate::registry::ConnectionRegistry;

/// Result of one broadcast.
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    /// Observers that accepted the frame.
    pub delivered: usize,
    /// Observers removed after a failed write.
    pub evicted: Vec<Arc<Connection>>,
}

/// Sends [`HubEvent`]s to every observer registered in the shared registry.
#[derive(Debug)]
pub struct EventBroadcaster {
    registry: Arc<ConnectionRegistry>,
    evict_failed: bool,
}

impl EventBroadcaster {
    /// Broadcaster over the observers in `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>, evict_failed: bool) -> Self {
        Self {
            registry,
            evict_failed,
        }
    }

    /// Add an observer. Returns a displaced observer with the same id.
    pub fn subscribe(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.registry.register(conn)
    }

    /// Remove an observer by id.
    pub fn unsubscribe(&self, id: &str) -> Option<Arc<Connection>> {
        self.registry.unregister(ConnectionKind::Observer, id)
    }

    /// Number of observers.
    pub fn subscriber_count(&self) -> usize {
        self.registry.len(ConnectionKind::Observer)
    }

    /// Serialize `event` once and write it to each observer in turn.
    pub async fn broadcast(&self, event: &HubEvent) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        let subscribers = self.registry.snapshot(ConnectionKind::Observer);
        if subscribers.is_empty() {
            return outcome;
        }
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize hub event");
                return outcome;
            }
        };

        for sub in subscribers {
            match sub.send(json.clone()).await {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    warn!(conn_id = sub.id(), error = %e, "broadcast write failed");
                    if self.evict_failed && self.registry.remove_exact(&sub) {
                        sub.close();
                        counter!(BROADCAST_EVICTIONS_TOTAL).increment(1);
                        outcome.evicted.push(sub);
                    }
                }
            }
        }
        counter!(BROADCAST_DELIVERIES_TOTAL).increment(outcome.delivered as u64);
        debug!(
            delivered = outcome.delivered,
            evicted = outcome.evicted.len(),
            "broadcast event"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::conn;
    use std::sync::atomic::Ordering;

    fn event() -> HubEvent {
        HubEvent::RulesChanged { count: 3 }
    }

    #[tokio::test]
    async fn delivers_to_every_subscriber() {
        let bus = EventBroadcaster::new(Arc::new(ConnectionRegistry::new()), true);
        let (a, sink_a) = conn(ConnectionKind::Observer, "obs_a", 1);
        let (b, sink_b) = conn(ConnectionKind::Observer, "obs_b", 2);
        let _ = bus.subscribe(a);
        let _ = bus.subscribe(b);

        let out = bus.broadcast(&event()).await;
        assert_eq!(out.delivered, 2);
        assert!(out.evicted.is_empty());
        assert!(sink_a.frames.lock()[0].contains("rules_changed"));
        assert_eq!(sink_b.frames.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_subscriber_is_evicted() {
        let bus = EventBroadcaster::new(Arc::new(ConnectionRegistry::new()), true);
        let (good, _) = conn(ConnectionKind::Observer, "obs_a", 1);
        let (bad, sink) = conn(ConnectionKind::Observer, "obs_b", 2);
        sink.fail.store(true, Ordering::SeqCst);
        let _ = bus.subscribe(good);
        let _ = bus.subscribe(Arc::clone(&bad));

        let out = bus.broadcast(&event()).await;
        assert_eq!(out.delivered, 1);
        assert_eq!(out.evicted.len(), 1);
        assert!(bad.is_closed());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn failed_subscriber_kept_when_eviction_disabled() {
        let bus = EventBroadcaster::new(Arc::new(ConnectionRegistry::new()), false);
        let (bad, sink) = conn(ConnectionKind::Observer, "obs_b", 2);
        sink.fail.store(true, Ordering::SeqCst);
        let _ = bus.subscribe(bad);

        let out = bus.broadcast(&event()).await;
        assert_eq!(out.delivered, 0);
        assert!(out.evicted.is_empty());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes() {
        let bus = EventBroadcaster::new(Arc::new(ConnectionRegistry::new()), true);
        let (a, _) = conn(ConnectionKind::Observer, "obs_a", 1);
        let _ = bus.subscribe(a);
        assert!(bus.unsubscribe("obs_a").is_some());
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.broadcast(&event()).await.delivered, 0);
    }
}
