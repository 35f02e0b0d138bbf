//! Control boundary: wires the services together and exposes them to
//! external surfaces.
//!
//! The desktop control surface, the web dashboard and the CLI never touch
//! the connection server or the session manager directly.  They hold an
//! `Arc<Orchestrator>` and call the command functions in this module, each
//! of which returns a [`CommandResult`].
//!
//! # `CommandResult<T>` wrapper
//!
//! Every command returns the same shape:
//! `{ success: bool, data: T | null, error: string | null }`.
//! A UI can always read `result.success` without special error handling,
//! and the wrapper serializes directly to JSON for a web client.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gsr_core::protocol::StartPayload;
use gsr_core::{Envelope, Payload, SessionSummary, SyncMark};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::application::error_recovery::{ErrorRecoveryManager, ErrorReport};
use crate::application::manage_devices::{DeviceInfo, DeviceRegistry};
use crate::application::performance::{
    PerformanceMetrics, PerformanceMonitor, PerformanceSummary, ResourceProbe, ServerCounters,
    SysinfoProbe,
};
use crate::application::session_manager::SessionManager;
use crate::application::time_sync::{ClockOffset, ProbeTransport, TimeSyncService};
use crate::infrastructure::network::connection_server::{
    ConnectionServer, ServerContext, ServerError,
};
use crate::infrastructure::storage::config::{AppConfig, ConfigError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// Every service of one controller process.
pub struct Orchestrator {
    config: AppConfig,
    ctx: ServerContext,
    server: Arc<ConnectionServer>,
}

impl Orchestrator {
    /// Builds the services from `config`, measuring resources with
    /// `sysinfo`.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Config`] if the server settings are invalid.
    pub fn new(config: AppConfig) -> Result<Arc<Self>, OrchestratorError> {
        Self::with_resource_probe(config, Box::new(SysinfoProbe::new()))
    }

    /// Like [`Orchestrator::new`] with a caller-supplied resource probe.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Config`] if the server settings are invalid.
    pub fn with_resource_probe(
        config: AppConfig,
        probe: Box<dyn ResourceProbe>,
    ) -> Result<Arc<Self>, OrchestratorError> {
        let server_settings = config.server_settings()?;

        let counters = Arc::new(ServerCounters::new());
        let devices = Arc::new(DeviceRegistry::new());
        let transport: Arc<dyn ProbeTransport> = Arc::clone(&devices) as Arc<dyn ProbeTransport>;
        let ctx = ServerContext {
            sessions: Arc::new(SessionManager::with_retention(config.session_retention())),
            time_sync: Arc::new(TimeSyncService::new(config.time_sync_settings(), transport)),
            recovery: Arc::new(ErrorRecoveryManager::with_default_strategies(
                config.recovery_settings(),
            )),
            performance: Arc::new(PerformanceMonitor::new(
                config.performance_settings(),
                Arc::clone(&counters),
                probe,
            )),
            devices,
            counters,
            export_dir: config.storage.export_dir.clone(),
        };
        let server = Arc::new(ConnectionServer::new(server_settings, ctx.clone()));

        Ok(Arc::new(Self {
            config,
            ctx,
            server,
        }))
    }

    /// Binds the device listener, then starts the background services.
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Server`] if the listener cannot be bound; no
    /// background service is started in that case.
    pub async fn start(&self) -> Result<SocketAddr, OrchestratorError> {
        let addr = self.server.start().await?;
        self.ctx.time_sync.start().await;
        self.ctx.recovery.start().await;
        self.ctx.performance.start().await;
        info!("orchestrator running; devices connect to ws://{addr}");
        Ok(addr)
    }

    /// Stops accepting devices, drains connections, then stops the
    /// background services.
    pub async fn shutdown(&self) {
        self.server.stop().await;
        self.ctx.time_sync.stop().await;
        self.ctx.performance.stop().await;
        self.ctx.recovery.stop().await;

        let recording = self.ctx.sessions.active_session_count().await;
        if recording > 0 {
            warn!("shutting down with {recording} session(s) still recording");
        }
        info!("orchestrator stopped");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn services(&self) -> &ServerContext {
        &self.ctx
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr().await
    }

    /// Best-effort notification of a connected device.
    async fn notify_device(&self, device_id: &str, payload: Payload) {
        if let Some(sender) = self.ctx.devices.sender(device_id).await {
            if sender.try_send(Envelope::new(device_id, payload)).is_err() {
                warn!("could not notify device {device_id}: outbound queue unavailable");
            }
        }
    }
}

// ── Data Transfer Objects ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDto {
    pub listening_on: Option<String>,
    pub connected_devices: usize,
    pub active_sessions: usize,
    pub time_sync_running: bool,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub errors: u64,
}

/// Start request from a control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub device_id: String,
    pub session_name: String,
    #[serde(default)]
    pub participant_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

/// Unified response wrapper used by control commands.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResult<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn get_status(state: Arc<Orchestrator>) -> CommandResult<StatusDto> {
    let counters = state.ctx.counters.snapshot();
    CommandResult::ok(StatusDto {
        listening_on: state.local_addr().await.map(|a| a.to_string()),
        connected_devices: state.ctx.devices.len().await,
        active_sessions: state.ctx.sessions.active_session_count().await,
        time_sync_running: state.ctx.time_sync.is_running(),
        messages_received: counters.messages_received,
        messages_sent: counters.messages_sent,
        errors: counters.errors,
    })
}

pub async fn get_devices(state: Arc<Orchestrator>) -> CommandResult<Vec<DeviceInfo>> {
    CommandResult::ok(state.ctx.devices.list().await)
}

/// Starts a session for `device_id` and forwards `START` to the device if
/// it is connected.
pub async fn start_session(
    state: Arc<Orchestrator>,
    request: StartSessionRequest,
) -> CommandResult<String> {
    let result = state
        .ctx
        .sessions
        .start_session(
            &request.device_id,
            &request.session_name,
            request.participant_id.clone(),
            request.metadata.clone(),
        )
        .await;
    match result {
        Ok(session_id) => {
            state
                .ctx
                .performance
                .update_session_count(state.ctx.sessions.active_session_count().await);
            let payload = Payload::Start(StartPayload {
                session_name: request.session_name,
                participant_id: request.participant_id,
                metadata: request.metadata,
            });
            state.notify_device(&request.device_id, payload).await;
            CommandResult::ok(session_id)
        }
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Stops the device's session, forwards `STOP` and exports it.
pub async fn stop_session(
    state: Arc<Orchestrator>,
    device_id: String,
) -> CommandResult<SessionSummary> {
    match state.ctx.sessions.stop_session(&device_id).await {
        Ok(session) => {
            state
                .ctx
                .performance
                .update_session_count(state.ctx.sessions.active_session_count().await);
            state.notify_device(&device_id, Payload::Stop).await;
            let summary = session.summary();
            state.ctx.export_finished(session);
            CommandResult::ok(summary)
        }
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Records an operator-initiated sync mark in the device's active session.
pub async fn add_sync_mark(
    state: Arc<Orchestrator>,
    device_id: String,
    mark_id: String,
    description: String,
) -> CommandResult<SyncMark> {
    match state
        .ctx
        .sessions
        .record_sync_mark(&device_id, &mark_id, &description)
        .await
    {
        Ok(mark) => CommandResult::ok(mark),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

pub async fn get_active_session(
    state: Arc<Orchestrator>,
    device_id: String,
) -> CommandResult<SessionSummary> {
    match state.ctx.sessions.get_active_session(&device_id).await {
        Some(session) => CommandResult::ok(session.summary()),
        None => CommandResult::err(format!("no active session for device {device_id}")),
    }
}

pub async fn get_session_by_id(
    state: Arc<Orchestrator>,
    session_id: String,
) -> CommandResult<SessionSummary> {
    match state.ctx.sessions.get_session_summary(&session_id).await {
        Some(summary) => CommandResult::ok(summary),
        None => CommandResult::err(format!("unknown session {session_id}")),
    }
}

pub async fn list_sessions(state: Arc<Orchestrator>) -> CommandResult<Vec<SessionSummary>> {
    CommandResult::ok(state.ctx.sessions.list_sessions().await)
}

pub async fn get_clock_offset(
    state: Arc<Orchestrator>,
    device_id: String,
) -> CommandResult<ClockOffset> {
    match state.ctx.time_sync.get_offset(&device_id) {
        Some(offset) => CommandResult::ok(offset),
        None => CommandResult::err(format!("no clock estimate for device {device_id} yet")),
    }
}

pub async fn get_performance_summary(
    state: Arc<Orchestrator>,
) -> CommandResult<PerformanceSummary> {
    CommandResult::ok(state.ctx.performance.get_performance_summary())
}

pub async fn get_metrics_history(
    state: Arc<Orchestrator>,
    window_secs: u64,
) -> CommandResult<Vec<PerformanceMetrics>> {
    CommandResult::ok(
        state
            .ctx
            .performance
            .get_metrics_history(Duration::from_secs(window_secs)),
    )
}

pub async fn get_error_report(state: Arc<Orchestrator>) -> CommandResult<ErrorReport> {
    CommandResult::ok(state.ctx.recovery.get_error_report())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
