//! TOML-based configuration for the orchestrator.
//!
//! The config file is looked up at the path given on the command line, or
//! in the platform config directory:
//! - Windows:  `%APPDATA%\GsrOrchestrator\config.toml`
//! - Linux:    `~/.config/gsr-orchestrator/config.toml`
//! - macOS:    `~/Library/Application Support/GsrOrchestrator/config.toml`
//!
//! A missing file is not an error: the orchestrator starts with defaults.
//! Every field carries `#[serde(default = "...")]`, so a file only needs the
//! values it wants to change:
//!
//! ```toml
//! [server]
//! port = 9000
//!
//! [storage]
//! export_dir = "/var/lib/gsr/sessions"
//! retained_sessions = 4
//! ```

use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gsr_core::protocol::SyncConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::error_recovery::RecoverySettings;
use crate::application::performance::PerformanceSettings;
use crate::application::session_manager::SessionRetention;
use crate::application::time_sync::TimeSyncSettings;
use crate::infrastructure::network::connection_server::ConnectionServerSettings;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// `server.bind_address` is not an IP address.
    #[error("invalid bind address '{address}': {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: AddrParseError,
    },
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub time_sync: TimeSyncConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device-facing WebSocket listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// IP address to bind.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Secondary sync port advertised to devices in REGISTER.
    #[serde(default = "default_sync_port")]
    pub sync_port: u16,
    /// Outbound envelopes buffered per connection.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Keepalive PING period; `0` disables it.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSyncConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Probes with a longer round trip are discarded.
    #[serde(default = "default_max_rtt_ms")]
    pub max_rtt_ms: u64,
    /// Probe results kept per device.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Offset change that is logged as a clock jump.
    #[serde(default = "default_offset_threshold_ms")]
    pub offset_threshold_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryConfig {
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceConfig {
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Finished sessions and device uploads are written here when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_dir: Option<PathBuf>,
    /// Finished sessions whose samples stay in memory until exported.
    #[serde(default = "default_retained_sessions")]
    pub retained_sessions: usize,
    /// Finished sessions listed at all; older ones are forgotten.
    #[serde(default = "default_max_finished_sessions")]
    pub max_finished_sessions: usize,
    /// Largest file a device may upload, in MiB.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_sync_port() -> u16 {
    9123
}
fn default_outbound_queue() -> usize {
    256
}
fn default_ping_interval_secs() -> u64 {
    30
}
fn default_refresh_interval_secs() -> u64 {
    30
}
fn default_max_rtt_ms() -> u64 {
    500
}
fn default_window() -> usize {
    8
}
fn default_offset_threshold_ms() -> u64 {
    5
}
fn default_monitor_interval_secs() -> u64 {
    30
}
fn default_sample_interval_secs() -> u64 {
    5
}
fn default_history_capacity() -> usize {
    720
}
fn default_retained_sessions() -> usize {
    16
}
fn default_max_finished_sessions() -> usize {
    10_000
}
fn default_max_upload_mb() -> u64 {
    512
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            sync_port: default_sync_port(),
            outbound_queue: default_outbound_queue(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            max_rtt_ms: default_max_rtt_ms(),
            window: default_window(),
            offset_threshold_ms: default_offset_threshold_ms(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval_secs(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval_secs(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            export_dir: None,
            retained_sessions: default_retained_sessions(),
            max_finished_sessions: default_max_finished_sessions(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Conversion into service settings ──────────────────────────────────────────

impl AppConfig {
    /// Listener settings.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidAddress`] if `bind_address` is not an IP.
    pub fn server_settings(&self) -> Result<ConnectionServerSettings, ConfigError> {
        let ip: IpAddr =
            self.server
                .bind_address
                .parse()
                .map_err(|source| ConfigError::InvalidAddress {
                    address: self.server.bind_address.clone(),
                    source,
                })?;
        Ok(ConnectionServerSettings {
            bind_addr: SocketAddr::new(ip, self.server.port),
            sync_port: self.server.sync_port,
            outbound_queue: self.server.outbound_queue.max(1),
            ping_interval: match self.server.ping_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            sync_config: SyncConfig {
                sync_interval_ms: self.time_sync.refresh_interval_secs * 1000,
                offset_threshold_ms: self.time_sync.offset_threshold_ms,
            },
            max_upload_bytes: self.storage.max_upload_mb.saturating_mul(1024 * 1024),
        })
    }

    pub fn session_retention(&self) -> SessionRetention {
        SessionRetention {
            retained_sessions: self.storage.retained_sessions,
            max_finished_sessions: self.storage.max_finished_sessions.max(1),
        }
    }

    pub fn time_sync_settings(&self) -> TimeSyncSettings {
        TimeSyncSettings {
            refresh_interval: Duration::from_secs(self.time_sync.refresh_interval_secs.max(1)),
            max_rtt: Duration::from_millis(self.time_sync.max_rtt_ms),
            window: self.time_sync.window.max(1),
            offset_threshold: Duration::from_millis(self.time_sync.offset_threshold_ms),
        }
    }

    pub fn recovery_settings(&self) -> RecoverySettings {
        RecoverySettings {
            monitor_interval: Duration::from_secs(self.recovery.monitor_interval_secs.max(1)),
            ..RecoverySettings::default()
        }
    }

    pub fn performance_settings(&self) -> PerformanceSettings {
        PerformanceSettings {
            sample_interval: Duration::from_secs(self.performance.sample_interval_secs.max(1)),
            history_capacity: self.performance.history_capacity.max(1),
            ..PerformanceSettings::default()
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default config file path in the platform config directory.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("GsrOrchestrator"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("gsr-orchestrator"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("GsrOrchestrator")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
