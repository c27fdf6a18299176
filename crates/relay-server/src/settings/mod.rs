//! Relay settings: compiled defaults, an optional JSON file and environment
//! overrides.

pub mod loader;

use std::collections::BTreeMap;
use std::time::Duration;

use relay_hub::{HubConfig, RoutingRule};
use relay_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};

pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};

/// Root settings document (`~/.relay/settings.json`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelaySettings {
    /// Listener and socket options.
    pub server: ServerSettings,
    /// Hub tunables.
    pub hub: HubConfig,
    /// Log output.
    pub logging: LoggingSettings,
    /// Routing rules seeded into the in-memory rule store at startup.
    pub rules: Vec<RoutingRule>,
}

/// HTTP / WebSocket listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Seconds between server-initiated ping frames.
    pub ping_interval_secs: u64,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_bytes: usize,
    /// Seconds to wait for tasks during graceful shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            ping_interval_secs: 30,
            max_message_bytes: 16 * 1024 * 1024,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerSettings {
    /// Ping period, never shorter than one second.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    /// Graceful shutdown budget.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    /// Default level (`trace` .. `error`).
    pub level: String,
    /// Emit JSON lines.
    pub json: bool,
    /// Per-module level overrides, e.g. `{"relay_hub": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

impl LoggingSettings {
    /// Telemetry configuration for these settings.
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig::from_levels(
            &self.level,
            self.modules.iter().map(|(m, l)| (m.as_str(), l.as_str())),
            self.json,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let s = RelaySettings::default();
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.server.ping_interval(), Duration::from_secs(30));
        assert_eq!(s.hub, HubConfig::default());
        assert_eq!(s.logging.level, "info");
        assert!(s.rules.is_empty());
    }

    #[test]
    fn camel_case_keys() {
        let v = serde_json::to_value(RelaySettings::default()).unwrap();
        assert!(v["server"]["pingIntervalSecs"].is_number());
        assert!(v["hub"]["heartbeatTimeoutSecs"].is_number());
        assert!(v["logging"]["modules"].is_object());
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let s: RelaySettings = serde_json::from_value(json!({
            "server": {"port": 9000},
            "rules": [{"pattern": "grp:*", "target": "w1"}]
        }))
        .unwrap();
        assert_eq!(s.server.port, 9000);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.rules, vec![RoutingRule::new("grp:*", "w1")]);
    }

    #[test]
    fn zero_ping_interval_is_clamped() {
        let server = ServerSettings {
            ping_interval_secs: 0,
            ..ServerSettings::default()
        };
        assert_eq!(server.ping_interval(), Duration::from_secs(1));
    }

    #[test]
    fn logging_maps_to_telemetry_directives() {
        let logging = LoggingSettings {
            level: "debug".into(),
            json: true,
            modules: BTreeMap::from([("relay_hub".to_string(), "trace".to_string())]),
        };
        let telemetry = logging.telemetry();
        assert_eq!(telemetry.filter_directives(), "debug,relay_hub=trace");
        assert!(telemetry.json);
    }
}
