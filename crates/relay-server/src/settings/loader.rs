//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `RELAY_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use super::RelaySettings;
use crate::errors::Result;

/// Resolve the default settings file path (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path` with env var overrides.
///
/// A missing file yields the defaults. A file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = read_merged(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn read_merged(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, and nulls in
/// `source` leave `target` untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RELAY_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Values that fail to parse or fall
/// outside their range are ignored with a warning.
pub fn apply_overrides(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("RELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = checked(&read, "RELAY_PORT", |s| parse_u16_range(s, 1, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = checked(&read, "RELAY_HEARTBEAT_TIMEOUT_SECS", |s| {
        parse_u64_range(s, 1, 86_400)
    }) {
        settings.hub.heartbeat_timeout_secs = v;
    }
    if let Some(v) = checked(&read, "RELAY_SWEEP_INTERVAL_SECS", |s| {
        parse_u64_range(s, 1, 3_600)
    }) {
        settings.hub.sweep_interval_secs = v;
    }
    if let Some(v) = checked(&read, "RELAY_ASK_TIMEOUT_MS", |s| {
        parse_u64_range(s, 100, 600_000)
    }) {
        settings.hub.ask_timeout_ms = v;
    }
    if let Some(v) = checked(&read, "RELAY_WRITE_TIMEOUT_MS", |s| {
        parse_u64_range(s, 10, 600_000)
    }) {
        settings.hub.write_timeout_ms = v;
    }
    if let Some(v) = checked(&read, "RELAY_LOG_LEVEL", parse_level) {
        settings.logging.level = v;
    }
    if let Some(v) = checked(&read, "RELAY_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

fn checked<T>(
    read: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = read(name)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(key = name, value = %raw, "invalid env override, ignoring");
    }
    parsed
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a boolean. Accepts (case-insensitive) `true`/`1`/`yes`/`on` and
/// `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u16` within `[min, max]`.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `u64` within `[min, max]`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Normalise a log level name.
pub fn parse_level(val: &str) -> Option<String> {
    let lower = val.to_lowercase();
    matches!(lower.as_str(), "trace" | "debug" | "info" | "warn" | "error").then_some(lower)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::errors::SettingsError;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let merged = deep_merge(
            json!({"server": {"port": 8080, "host": "localhost"}}),
            json!({"server": {"port": 9090}}),
        );
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_skips_null() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_replaces_arrays() {
        let merged = deep_merge(json!({"rules": [1, 2, 3]}), json!({"rules": [4]}));
        assert_eq!(merged["rules"], json!([4]));
    }

    #[test]
    fn merge_adds_new_keys() {
        let merged = deep_merge(json!({"a": 1}), json!({"b": {"c": 2}}));
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"]["c"], 2);
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = read_merged(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s, RelaySettings::default());
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"hub": {"heartbeatTimeoutSecs": 30}, "logging": {"modules": {"relay_hub": "debug"}}}"#,
        )
        .unwrap();
        let s = read_merged(&path).unwrap();
        assert_eq!(s.hub.heartbeat_timeout_secs, 30);
        assert_eq!(s.hub.sweep_interval_secs, 60);
        assert_eq!(s.logging.modules["relay_hub"], "debug");
        assert_eq!(s.server.port, 8080);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(read_merged(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn wrong_type_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": "eighty"}}"#).unwrap();
        assert!(matches!(read_merged(&path), Err(SettingsError::Json(_))));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply() {
        let mut s = RelaySettings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("RELAY_HOST", "127.0.0.1"),
                ("RELAY_PORT", "9100"),
                ("RELAY_HEARTBEAT_TIMEOUT_SECS", "45"),
                ("RELAY_SWEEP_INTERVAL_SECS", "5"),
                ("RELAY_ASK_TIMEOUT_MS", "2500"),
                ("RELAY_WRITE_TIMEOUT_MS", "750"),
                ("RELAY_LOG_LEVEL", "DEBUG"),
                ("RELAY_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.server.port, 9100);
        assert_eq!(s.hub.heartbeat_timeout_secs, 45);
        assert_eq!(s.hub.sweep_interval_secs, 5);
        assert_eq!(s.hub.ask_timeout_ms, 2500);
        assert_eq!(s.hub.write_timeout_ms, 750);
        assert_eq!(s.logging.level, "debug");
        assert!(s.logging.json);
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let mut s = RelaySettings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("RELAY_HOST", ""),
                ("RELAY_PORT", "0"),
                ("RELAY_HEARTBEAT_TIMEOUT_SECS", "-3"),
                ("RELAY_ASK_TIMEOUT_MS", "5"),
                ("RELAY_WRITE_TIMEOUT_MS", "0"),
                ("RELAY_LOG_LEVEL", "loud"),
                ("RELAY_LOG_JSON", "maybe"),
            ]),
        );
        assert_eq!(s, RelaySettings::default());
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_values() {
        for v in ["true", "TRUE", "1", "yes", "on"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "No", "off"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
        assert_eq!(parse_u64_range("10", 1, 10), Some(10));
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_u64_range("abc", 1, 10), None);
    }

    #[test]
    fn settings_path_ends_with_relay_dir() {
        let p = settings_path();
        assert!(p.ends_with(".relay/settings.json"));
    }
}
