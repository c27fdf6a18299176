//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::TelemetryError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Call once at
/// startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, TelemetryError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Handle backed by a recorder that is not installed globally. Used by tests
/// and by servers started without a global recorder.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants shared across crates.

/// Connections accepted (counter, labels: kind).
pub const CONNECTIONS_OPENED_TOTAL: &str = "relay_connections_opened_total";
/// Connections closed (counter, labels: kind, reason).
pub const CONNECTIONS_CLOSED_TOTAL: &str = "relay_connections_closed_total";
/// Live connections (gauge, labels: kind).
pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Dispatch attempts (counter, labels: outcome).
pub const DISPATCH_TOTAL: &str = "relay_dispatch_total";
/// Correlated calls (counter, labels: target, outcome).
pub const ASK_TOTAL: &str = "relay_ask_total";
/// Correlated call latency (histogram, labels: target).
pub const ASK_DURATION_SECONDS: &str = "relay_ask_duration_seconds";
/// Outstanding correlated calls (gauge).
pub const PENDING_REQUESTS: &str = "relay_pending_requests";
/// Broadcast frames delivered (counter).
pub const BROADCAST_DELIVERIES_TOTAL: &str = "relay_broadcast_deliveries_total";
/// Subscribers evicted after a failed write (counter).
pub const BROADCAST_EVICTIONS_TOTAL: &str = "relay_broadcast_evictions_total";
/// Inbound frames that failed to decode (counter, labels: kind).
pub const DECODE_ERRORS_TOTAL: &str = "relay_decode_errors_total";
/// Liveness sweeps run (counter).
pub const LIVENESS_SWEEPS_TOTAL: &str = "relay_liveness_sweeps_total";
