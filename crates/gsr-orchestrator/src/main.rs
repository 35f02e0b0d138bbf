//! GSR orchestrator: entry point.
//!
//! Runs the device orchestration engine as a standalone process.  Devices
//! connect over WebSocket, register with HELLO, and record sessions that are
//! optionally exported to disk when they stop.
//!
//! # Usage
//!
//! ```text
//! gsr-orchestrator [OPTIONS]
//!
//! Options:
//!   --config    <PATH>   TOML config file [default: platform config dir]
//!   --bind      <IP>     Override server.bind_address
//!   --port      <PORT>   Override server.port
//!   --log-level <LEVEL>  Override logging.level
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable     | Option        |
//! |--------------|---------------|
//! | `GSR_CONFIG` | `--config`    |
//! | `GSR_BIND`   | `--bind`      |
//! | `GSR_PORT`   | `--port`      |
//! | `GSR_LOG`    | `--log-level` |
//!
//! `RUST_LOG`, when set, takes precedence over every configured log level.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gsr_orchestrator::infrastructure::control::Orchestrator;
use gsr_orchestrator::infrastructure::storage::config::{
    config_file_path, load_config, AppConfig, ConfigError,
};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// GSR device orchestration engine.
#[derive(Debug, Parser)]
#[command(
    name = "gsr-orchestrator",
    about = "Coordinates GSR sensing devices: sessions, time sync and recovery",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "GSR_CONFIG")]
    config: Option<PathBuf>,

    /// IP address the device listener binds to.
    #[arg(long, env = "GSR_BIND")]
    bind: Option<String>,

    /// TCP port devices connect to.
    #[arg(long, env = "GSR_PORT")]
    port: Option<u16>,

    /// `tracing` filter, e.g. `info` or `gsr_orchestrator=debug`.
    #[arg(long, env = "GSR_LOG")]
    log_level: Option<String>,
}

impl Cli {
    /// Loads the configuration file and applies command-line overrides.
    ///
    /// Falls back to defaults when no path is given and the platform config
    /// directory cannot be determined.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    fn into_app_config(self) -> anyhow::Result<AppConfig> {
        let path = match self.config {
            Some(path) => Some(path),
            None => match config_file_path() {
                Ok(path) => Some(path),
                Err(ConfigError::NoPlatformConfigDir) => None,
                Err(e) => return Err(e.into()),
            },
        };

        let mut config = match &path {
            Some(path) => load_config(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => AppConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.server.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_app_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.logging.level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        "GSR orchestrator starting: bind={}:{}, sync_port={}",
        config.server.bind_address, config.server.port, config.server.sync_port
    );
    if let Some(dir) = &config.storage.export_dir {
        info!("finished sessions will be exported to {}", dir.display());
    }

    let orchestrator = Orchestrator::new(config).context("invalid configuration")?;
    orchestrator
        .start()
        .await
        .context("failed to start orchestrator")?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => warn!("failed to listen for Ctrl+C ({e}); shutting down"),
    }
    orchestrator.shutdown().await;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
