//! `/health` endpoint.

use std::time::Instant;

use relay_hub::HubStats;
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while the server runs, `"shutting_down"` once stopping.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live bot connections.
    pub bots: usize,
    /// Live worker connections.
    pub workers: usize,
    /// Live observer connections.
    pub observers: usize,
    /// Outstanding correlated calls.
    pub pending_requests: usize,
    /// Active routing rules.
    pub rules: usize,
}

/// Build a health response from hub counters.
pub fn health_check(start_time: Instant, stats: &HubStats, shutting_down: bool) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        bots: stats.bots,
        workers: stats.workers,
        observers: stats.observers,
        pending_requests: stats.pending_requests,
        rules: stats.rules,
    }
}
