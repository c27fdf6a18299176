//! # relay
//!
//! Relay hub binary: loads settings, installs telemetry, builds the hub and
//! serves the WebSocket endpoints until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_hub::{Hub, MemoryRuleStore, SystemClock};
use relay_server::RelayServer;
use relay_server::settings::{self, RelaySettings};

/// Bot/worker message hub.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Bot/worker message hub")]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings; 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    fn load_settings(&self) -> Result<RelaySettings> {
        let path = self.config.clone().unwrap_or_else(settings::settings_path);
        let mut settings = settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;

    relay_telemetry::init_telemetry(&settings.logging.telemetry())
        .context("Failed to initialise logging")?;
    let metrics = relay_telemetry::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let store = Arc::new(MemoryRuleStore::with_rules(settings.rules.clone()));
    let hub = Hub::new(settings.hub.clone(), store, Arc::new(SystemClock));
    let rule_count = hub.reload_rules().await.context("Failed to load routing rules")?;

    let shutdown_timeout = settings.server.shutdown_timeout();
    let server = RelayServer::new(settings.server, hub.clone(), metrics);
    let liveness = hub.spawn_liveness(server.shutdown().token());

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(%addr, rules = rule_count, "relay hub ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown()
        .graceful_shutdown(vec![handle, liveness], Some(shutdown_timeout))
        .await;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["relay"]);
        assert!(cli.config.is_none());
        assert!(cli.port.is_none());
    }

    #[test]
    fn cli_overrides_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 7000, "host": "10.0.0.1"}}"#).unwrap();

        let cli = Cli::parse_from([
            "relay",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "7100",
        ]);
        let settings = cli.load_settings().unwrap();
        assert_eq!(settings.server.port, 7100);
        assert_eq!(settings.server.host, "10.0.0.1");
    }

    #[test]
    fn bad_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{").unwrap();
        let cli = Cli::parse_from(["relay", "--config", path.to_str().unwrap()]);
        assert!(cli.load_settings().is_err());
    }
}
