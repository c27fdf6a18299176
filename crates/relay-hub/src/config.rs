//! Hub configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the hub core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HubConfig {
    /// Seconds between liveness sweeps.
    pub sweep_interval_secs: u64,
    /// Seconds without a heartbeat before a bot or worker is evicted.
    pub heartbeat_timeout_secs: u64,
    /// Default deadline for correlated calls, in milliseconds.
    pub ask_timeout_ms: u64,
    /// Deadline for a single socket write, in milliseconds.
    pub write_timeout_ms: u64,
    /// Evict an observer on its first failed broadcast write.
    pub evict_failed_subscribers: bool,
    /// Number of disconnect records kept for inspection.
    pub disconnect_log_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            heartbeat_timeout_secs: 120,
            ask_timeout_ms: 30_000,
            write_timeout_ms: 5_000,
            evict_failed_subscribers: true,
            disconnect_log_capacity: 256,
        }
    }
}

impl HubConfig {
    /// Liveness sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Liveness window.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Default correlated-call deadline.
    pub fn ask_timeout(&self) -> Duration {
        Duration::from_millis(self.ask_timeout_ms)
    }

    /// Per-write socket deadline. Never zero.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(60));
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(120));
        assert!(cfg.evict_failed_subscribers);
        assert_eq!(cfg.write_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn zero_sweep_interval_is_clamped() {
        let cfg = HubConfig {
            sweep_interval_secs: 0,
            ..HubConfig::default()
        };
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn zero_write_timeout_is_clamped() {
        let cfg = HubConfig {
            write_timeout_ms: 0,
            ..HubConfig::default()
        };
        assert_eq!(cfg.write_timeout(), Duration::from_millis(1));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: HubConfig = serde_json::from_str(r#"{"heartbeatTimeoutSecs": 30}"#).unwrap();
        assert_eq!(cfg.heartbeat_timeout_secs, 30);
        assert_eq!(cfg.sweep_interval_secs, 60);
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = HubConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: HubConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
