//! Periodic eviction of bots and workers that stopped heartbeating.

use chrono::TimeDelta;
use metrics::counter;
use relay_telemetry::metrics::LIVENESS_SWEEPS_TOTAL;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::ConnectionKind;
use crate::events::{DisconnectReason, DisconnectRecord};
use crate::hub::Hub;

/// Sweeps the registry for connections idle longer than the liveness window.
///
/// Bots and workers are treated the same way. Idle time is measured from the
/// last heartbeat, or from the connect time if none was seen.
pub struct LivenessMonitor {
    hub: Hub,
}

impl LivenessMonitor {
    /// Monitor for `hub`.
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }

    /// Run one sweep. Returns a record per evicted connection.
    pub async fn sweep(&self) -> Vec<DisconnectRecord> {
        let now = self.hub.now();
        let window =
            TimeDelta::from_std(self.hub.config().heartbeat_timeout()).unwrap_or(TimeDelta::MAX);
        let mut evicted = Vec::new();

        for kind in [ConnectionKind::Bot, ConnectionKind::Worker] {
            for conn in self.hub.registry().snapshot(kind) {
                let idle = now - conn.last_seen();
                if idle <= window {
                    continue;
                }
                warn!(
                    kind = %kind,
                    conn_id = conn.id(),
                    idle_secs = idle.num_seconds(),
                    "heartbeat timeout"
                );
                if let Some(record) = self
                    .hub
                    .evict(&conn, DisconnectReason::HeartbeatTimeout)
                    .await
                {
                    evicted.push(record);
                }
            }
        }

        counter!(LIVENESS_SWEEPS_TOTAL).increment(1);
        debug!(evicted = evicted.len(), "liveness sweep complete");
        evicted
    }

    /// Sweep on a fixed period until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.hub.config().sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.sweep().await;
                }
                () = cancel.cancelled() => {
                    debug!("liveness monitor stopped");
                    return;
                }
            }
        }
    }
}
