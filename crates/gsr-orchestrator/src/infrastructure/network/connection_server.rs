//! Connection Server: WebSocket accept loop and per-device dispatch.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Upgrading each accepted connection to a WebSocket session.
//! 3. Decoding one JSON envelope per text frame and dispatching it to the
//!    handler for its type.
//! 4. Writing replies through a bounded per-connection queue drained by a
//!    writer task.
//! 5. Reporting every handler error to the Error Recovery Manager and
//!    answering the device with an `ERROR` envelope.
//! 6. Draining every connection on shutdown.
//!
//! # Concurrency model (for beginners)
//!
//! Each connection runs in its own Tokio task, so a slow or silent device
//! never delays another.  *Within* a connection, frames are handled strictly
//! one after another: the reader does not pull the next frame until the
//! current handler has finished.  A device that floods `GSR_DATA` therefore
//! fills its own TCP window and slows down, instead of growing an unbounded
//! queue on the controller.
//!
//! ```text
//!            ┌──────────── connection task ─────────────┐
//! device ──► │ ws_rx ─► decode ─► dispatch ─► out_tx ──┐ │
//!            │                                          ▼ │
//! device ◄── │ ws_tx ◄──────────── writer task ◄─ out_rx  │
//!            └───────────────────────────────────────────┘
//! ```
//!
//! A transport loss removes the device from the registry but leaves its
//! session recording.  Only an explicit `STOP` ends a session.  Uploads the
//! connection had not finished are discarded.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use gsr_core::protocol::{
    ack_status, error_code, is_safe_name, AckPayload, ErrorPayload, HelloPayload,
    RegisterPayload, SyncConfig, UploadEndPayload, PROTOCOL_VERSION,
};
use gsr_core::{
    decode_envelope, encode_envelope, DeviceId, Envelope, MessageType, Payload, ProtocolError,
    Session,
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::application::error_recovery::{
    ClassifiedError, ErrorCategory, ErrorContext, ErrorRecoveryManager,
};
use crate::application::manage_devices::{DeviceConnection, DeviceRegistry};
use crate::application::performance::{PerformanceMonitor, ServerCounters};
use crate::application::session_manager::{SessionError, SessionManager};
use crate::application::time_sync::TimeSyncService;
use crate::infrastructure::storage::session_export::{export_session, upload_dir};
use crate::infrastructure::storage::uploads::{CompletedUpload, UploadError, UploadTracker};

/// Service name reported to the Error Recovery Manager.
pub const SERVICE_NAME: &str = "connection_server";

/// Sender id on controller envelopes addressed to an unidentified peer.
const CONTROLLER_ID: &str = "controller";

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failure of one inbound message.  Never fatal to the server.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Malformed(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("{0}")]
    Connectivity(String),

    #[error("{0}")]
    Validation(String),
}

impl DispatchError {
    /// `code` carried in the `ERROR` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Malformed(_) => error_code::MALFORMED_MESSAGE,
            DispatchError::Session(SessionError::SessionConflict { .. }) => {
                error_code::SESSION_CONFLICT
            }
            DispatchError::Session(SessionError::NoActiveSession { .. }) => {
                error_code::NO_ACTIVE_SESSION
            }
            DispatchError::Upload(e) => e.code(),
            DispatchError::Connectivity(_) => error_code::CONNECTIVITY_ERROR,
            DispatchError::Validation(_) => error_code::VALIDATION_ERROR,
        }
    }
}

impl ClassifiedError for DispatchError {
    fn error_type(&self) -> &'static str {
        match self {
            DispatchError::Malformed(_) => "MalformedMessage",
            DispatchError::Session(e) => e.error_type(),
            DispatchError::Upload(e) => e.error_type(),
            DispatchError::Connectivity(_) => "ConnectionError",
            DispatchError::Validation(_) => "ValidationError",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            DispatchError::Malformed(_) => ErrorCategory::Protocol,
            DispatchError::Session(_) => ErrorCategory::Session,
            DispatchError::Upload(e) => e.category(),
            DispatchError::Connectivity(_) => ErrorCategory::Connectivity,
            DispatchError::Validation(_) => ErrorCategory::Validation,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind device listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connection server is already running on {0}")]
    AlreadyRunning(SocketAddr),
}

// ── Settings and shared services ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConnectionServerSettings {
    pub bind_addr: SocketAddr,
    /// Advertised in REGISTER.
    pub sync_port: u16,
    /// Outbound envelopes buffered per connection.
    pub outbound_queue: usize,
    /// Keepalive PING period for registered devices.
    pub ping_interval: Option<Duration>,
    pub sync_config: SyncConfig,
    /// Largest file a device may upload.
    pub max_upload_bytes: u64,
}

impl Default for ConnectionServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            sync_port: 9123,
            outbound_queue: 256,
            ping_interval: Some(Duration::from_secs(30)),
            sync_config: SyncConfig {
                sync_interval_ms: 30_000,
                offset_threshold_ms: 5,
            },
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Services the connection handlers delegate to.
#[derive(Clone)]
pub struct ServerContext {
    pub sessions: Arc<SessionManager>,
    pub devices: Arc<DeviceRegistry>,
    pub time_sync: Arc<TimeSyncService>,
    pub recovery: Arc<ErrorRecoveryManager>,
    pub performance: Arc<PerformanceMonitor>,
    pub counters: Arc<ServerCounters>,
    /// Finished sessions and uploads are written here when set.
    pub export_dir: Option<PathBuf>,
}

impl ServerContext {
    /// Writes a stopped session to the export directory, if one is
    /// configured, on the blocking pool.  Once written, the in-memory copy
    /// of its samples is released.
    pub fn export_finished(&self, session: Arc<Session>) -> Option<JoinHandle<()>> {
        let root = self.export_dir.clone()?;
        let offset = self.time_sync.get_offset(&session.device_id);
        let sessions = Arc::clone(&self.sessions);
        let session_id = session.id.clone();
        Some(tokio::spawn(async move {
            let written =
                tokio::task::spawn_blocking(move || export_session(&root, &session, offset)).await;
            match written {
                Ok(Ok(_)) => {
                    sessions.release_samples(&session_id).await;
                }
                Ok(Err(e)) => error!("failed to export session {session_id}: {e}"),
                Err(e) => error!("export of session {session_id} panicked: {e}"),
            }
        }))
    }
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
}

/// Per-connection state owned by the reader loop.
struct ConnectionState {
    connection_id: u64,
    peer_addr: SocketAddr,
    /// Set by an accepted HELLO.
    device_id: Option<DeviceId>,
    outbound: mpsc::Sender<Envelope>,
    closed: Arc<Notify>,
    uploads: UploadTracker,
}

impl ConnectionState {
    fn reply_id(&self) -> &str {
        self.device_id.as_deref().unwrap_or(CONTROLLER_ID)
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct ConnectionServer {
    settings: ConnectionServerSettings,
    ctx: ServerContext,
    next_connection_id: AtomicU64,
    running: tokio::sync::Mutex<Option<RunningServer>>,
}

impl ConnectionServer {
    pub fn new(settings: ConnectionServerSettings, ctx: ServerContext) -> Self {
        Self {
            settings,
            ctx,
            next_connection_id: AtomicU64::new(1),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Binds the listener and starts accepting devices.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port `0` was requested.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the address is unavailable, or
    /// [`ServerError::AlreadyRunning`].
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Err(ServerError::AlreadyRunning(r.local_addr));
        }

        let addr = self.settings.bind_addr;
        let bind_err = |source| ServerError::Bind { addr, source };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        info!("device connection server listening on {local_addr}");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = Arc::clone(self);
        let accept = tokio::spawn(server.accept_loop(listener, shutdown_rx));
        *running = Some(RunningServer {
            local_addr,
            shutdown,
            accept,
        });
        Ok(local_addr)
    }

    /// Stops accepting, closes every connection and waits for them to drain.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.accept.await {
            error!("accept loop ended abnormally: {e}");
        }
        info!("device connection server on {} stopped", running.local_addr);
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn settings(&self) -> &ConnectionServerSettings {
        &self.settings
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        self.ctx.counters.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        let server = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        connections.spawn(server.handle_connection(stream, peer_addr, shutdown));
                    }
                    // Transient (e.g. too many open files); keep serving.
                    Err(e) => error!("accept error: {e}"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("connection task panicked: {e}");
                    }
                }
            }
        }

        drop(listener);
        if !connections.is_empty() {
            info!("draining {} device connection(s)", connections.len());
        }
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!("connection task panicked: {e}");
            }
        }
    }

    // ── Per-connection handler ────────────────────────────────────────────────

    /// Wraps [`Self::run_connection`] and logs the outcome.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        match self.run_connection(stream, peer_addr, connection_id, shutdown).await {
            Ok(()) => info!("connection {connection_id} ({peer_addr}) closed"),
            Err(e) => warn!("connection {connection_id} ({peer_addr}) closed with error: {e:#}"),
        }
    }

    async fn run_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        connection_id: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let ws_stream = accept_async(stream)
            .await
            .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;
        debug!("connection {connection_id}: WebSocket established with {peer_addr}");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(self.settings.outbound_queue);

        // Ends once every sender (this connection, the registry entry) is gone.
        let counters = Arc::clone(&self.ctx.counters);
        let writer = tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let text = match encode_envelope(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(
                            "connection {connection_id}: cannot encode {}: {e}",
                            envelope.message_type()
                        );
                        continue;
                    }
                };
                if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                    debug!("connection {connection_id}: send failed, peer gone");
                    break;
                }
                counters.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            let _ = ws_tx.close().await;
        });

        let mut state = ConnectionState {
            connection_id,
            peer_addr,
            device_id: None,
            outbound: out_tx,
            closed: Arc::new(Notify::new()),
            uploads: UploadTracker::new(self.settings.max_upload_bytes),
        };
        let closed = Arc::clone(&state.closed);
        let mut keepalive = self.settings.ping_interval.map(|period| {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => {
                    debug!("connection {connection_id}: server shutting down");
                    break;
                }
                _ = closed.notified() => {
                    info!("connection {connection_id}: superseded by a newer connection");
                    break;
                }
                _ = tick(&mut keepalive) => {
                    if let Some(device_id) = &state.device_id {
                        let ping = Envelope::new(device_id.as_str(), Payload::Ping);
                        if state.outbound.try_send(ping).is_err() {
                            debug!(
                                "connection {connection_id}: outbound queue full, keepalive skipped"
                            );
                        }
                    }
                    continue;
                }
                frame = ws_rx.next() => frame,
            };

            let keep_open = match frame {
                Some(Ok(WsMessage::Text(text))) => self.handle_frame(&mut state, &text).await,
                Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.handle_frame(&mut state, text).await,
                    Err(_) => {
                        let err = DispatchError::Malformed(ProtocolError::MalformedMessage(
                            "binary frame is not UTF-8".to_string(),
                        ));
                        self.report(&mut state, err, None, None)
                    }
                },
                // Transport-level keepalive is answered by tungstenite.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => true,
                Some(Ok(WsMessage::Close(_))) | None => {
                    debug!("connection {connection_id}: closed by peer");
                    false
                }
                Some(Err(e)) => {
                    let err = DispatchError::Connectivity(format!("websocket read failed: {e}"));
                    self.report(&mut state, err, None, None);
                    false
                }
            };
            if !keep_open {
                break;
            }
        }

        self.teardown(&mut state).await;
        drop(state);
        if let Err(e) = writer.await {
            error!("connection {connection_id}: writer task panicked: {e}");
        }
        Ok(())
    }

    /// Discards unfinished uploads and unregisters the device if this
    /// connection still owns it.  The device's session is left as it is.
    async fn teardown(&self, state: &mut ConnectionState) {
        if state.uploads.pending_count() > 0 {
            info!(
                "connection {}: discarding {} unfinished upload(s)",
                state.connection_id,
                state.uploads.pending_count()
            );
            state.uploads.abort_all().await;
        }
        let Some(device_id) = &state.device_id else {
            return;
        };
        if self
            .ctx
            .devices
            .remove_if_current(device_id, state.connection_id)
            .await
        {
            self.sync_device_count().await;
                if let Some(session_id) = self.ctx.sessions.active_session_id(device_id).await {
                info!("device {device_id} disconnected; session {session_id} keeps recording");
            }
        }
    }

    /// Decodes and dispatches one frame.  Returns `false` to close.
    async fn handle_frame(&self, state: &mut ConnectionState, text: &str) -> bool {
        let started = Instant::now();
        self.ctx
            .counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        let (result, message_type, message_id) = match decode_envelope(text) {
            Ok(envelope) => {
                let message_type = envelope.message_type();
                let message_id = envelope.id().to_string();
                debug!(
                    "connection {}: {} from {}",
                    state.connection_id,
                    message_type,
                    envelope.device_id()
                );
                let result = self.dispatch(state, envelope).await;
                (result, Some(message_type), Some(message_id))
            }
            Err(e) => (Err(DispatchError::from(e)), None, None),
        };

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.ctx
            .performance
            .record_message(latency_ms, result.is_err());

        match result {
            Ok(()) => true,
            Err(err) => self.report(state, err, message_type, message_id),
        }
    }

    /// Hands `err` to recovery and tells the device.  Returns `false` when
    /// the recovery outcome asks for a disconnect.
    fn report(
        &self,
        state: &mut ConnectionState,
        err: DispatchError,
        message_type: Option<MessageType>,
        message_id: Option<String>,
    ) -> bool {
        self.ctx.counters.errors.fetch_add(1, Ordering::Relaxed);
        let context = ErrorContext {
            device_id: state.device_id.clone(),
            message_type,
        };
        let outcome = self.ctx.recovery.handle_error(&err, SERVICE_NAME, context);

        let payload = Payload::Error(ErrorPayload {
            code: err.code().to_string(),
            message: err.to_string(),
            message_id,
        });
        send(state, Envelope::new(state.reply_id(), payload));

        if outcome.should_disconnect() {
            warn!(
                "connection {} ({}): dropping after {}",
                state.connection_id,
                state.peer_addr,
                err.error_type()
            );
            return false;
        }
        true
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    async fn dispatch(
        &self,
        state: &mut ConnectionState,
        envelope: Envelope,
    ) -> Result<(), DispatchError> {
        let message_type = envelope.message_type();
        match &state.device_id {
            Some(registered) if envelope.device_id() != registered => {
                return Err(DispatchError::Validation(format!(
                    "deviceId {} does not match registered device {registered}",
                    envelope.device_id()
                )));
            }
            None if !allowed_before_hello(message_type) => {
                return Err(DispatchError::Validation(format!(
                    "HELLO required before {message_type}"
                )));
            }
            _ => {}
        }

        let message_id = envelope.id().to_string();
        let device_id = envelope.device_id().to_string();
        let sessions = &self.ctx.sessions;

        match envelope.into_payload() {
            Payload::Hello(hello) => self.on_hello(state, device_id, hello).await,
            Payload::Start(start) => {
                sessions
                    .start_session(
                        &device_id,
                        &start.session_name,
                        start.participant_id,
                        start.metadata,
                    )
                    .await?;
                self.sync_session_count().await;
                ack(state, message_id, ack_status::SESSION_STARTED);
                Ok(())
            }
            Payload::Stop => {
                let session = sessions.stop_session(&device_id).await?;
                self.sync_session_count().await;
                ack(state, message_id, ack_status::SESSION_STOPPED);
                self.ctx.export_finished(session);
                Ok(())
            }
            Payload::SyncMark(mark) => {
                sessions
                    .record_sync_mark(&device_id, &mark.mark_id, &mark.description)
                    .await?;
                ack(state, message_id, ack_status::SYNC_MARK_RECEIVED);
                Ok(())
            }
            Payload::GsrData(data) => {
                sessions.store_samples(&device_id, data.samples).await?;
                Ok(())
            }
            Payload::TimeSyncResponse(response) => {
                if self
                    .ctx
                    .time_sync
                    .handle_response(&device_id, &response)
                    .is_none()
                {
                    debug!(
                        "device {device_id}: time sync response {} discarded",
                        response.probe_id
                    );
                }
                Ok(())
            }
            Payload::UploadBegin(begin) => {
                let dir = self.upload_dir(&device_id).await?;
                state.uploads.begin(&dir, &begin).await?;
                ack(state, message_id, ack_status::UPLOAD_READY);
                Ok(())
            }
            Payload::UploadChunk(chunk) => {
                if let Some(done) = state.uploads.write_chunk(&chunk).await? {
                    self.on_upload_complete(state, &device_id, done).await;
                }
                Ok(())
            }
            Payload::UploadEnd(end) => {
                let done = state.uploads.finish(&end.file_name).await?;
                self.on_upload_complete(state, &device_id, done).await;
                Ok(())
            }
            Payload::Ping => {
                send(state, Envelope::new(device_id, Payload::Pong));
                Ok(())
            }
            Payload::Ack(_) | Payload::Empty | Payload::Pong => Ok(()),
            Payload::Register(_) | Payload::Error(_) | Payload::TimeSyncRequest(_) => Err(
                DispatchError::Validation(format!("{message_type} is sent by the controller only")),
            ),
        }
    }

    async fn on_hello(
        &self,
        state: &mut ConnectionState,
        device_id: DeviceId,
        hello: HelloPayload,
    ) -> Result<(), DispatchError> {
        // The id names directories under the export root.
        if !is_safe_name(&device_id) {
            return Err(DispatchError::Validation(format!(
                "deviceId '{}' must be 1-{} characters without path separators, '..' \
                 or control characters",
                device_id.escape_debug(),
                gsr_core::protocol::MAX_NAME_LEN
            )));
        }
        if !compatible_version(&hello.version) {
            warn!(
                "device {device_id} speaks protocol {}, expected {PROTOCOL_VERSION}",
                hello.version
            );
            let reject = RegisterPayload {
                accepted: false,
                reason: Some(format!(
                    "unsupported protocol version {} (controller speaks {PROTOCOL_VERSION})",
                    hello.version
                )),
                sync_port: None,
                sync_config: None,
            };
            send(state, Envelope::new(device_id, Payload::Register(reject)));
            return Ok(());
        }

        let connection = DeviceConnection {
            connection_id: state.connection_id,
            device_id: device_id.clone(),
            name: hello.device_name,
            capabilities: hello.capabilities,
            battery_level: hello.battery_level,
            protocol_version: hello.version,
            peer_addr: state.peer_addr,
            connected_at: Utc::now(),
            outbound: state.outbound.clone(),
            closed: Arc::clone(&state.closed),
        };
        self.ctx.devices.register(connection).await;
        state.device_id = Some(device_id.clone());
        self.sync_device_count().await;

        let accept = RegisterPayload {
            accepted: true,
            reason: None,
            sync_port: Some(self.settings.sync_port),
            sync_config: Some(self.settings.sync_config),
        };
        send(state, Envelope::new(device_id.as_str(), Payload::Register(accept)));

        // First clock estimate right away rather than at the next refresh.
        self.ctx.time_sync.probe_device(&device_id).await;
        Ok(())
    }

    async fn upload_dir(&self, device_id: &str) -> Result<PathBuf, UploadError> {
        let root = self.ctx.export_dir.as_deref().ok_or(UploadError::Disabled)?;
        let session_id = self.ctx.sessions.active_session_id(device_id).await;
        Ok(upload_dir(root, device_id, session_id.as_deref())?)
    }

    /// Notes the file on the recording session and tells the device.
    async fn on_upload_complete(
        &self,
        state: &ConnectionState,
        device_id: &str,
        done: CompletedUpload,
    ) {
        match self.ctx.sessions.record_upload(device_id, &done.file_name).await {
            Ok(()) => {}
            Err(SessionError::NoActiveSession { .. }) => {
                debug!("device {device_id}: '{}' stored outside a session", done.file_name);
            }
            Err(e) => warn!("device {device_id}: could not note upload: {e}"),
        }
        let payload = Payload::UploadEnd(UploadEndPayload {
            file_name: done.file_name,
            success: Some(true),
            total_chunks: Some(done.chunks),
            message: Some(format!("stored {} bytes", done.bytes)),
        });
        send(state, Envelope::new(device_id, payload));
    }

    async fn sync_session_count(&self) {
        let active = self.ctx.sessions.active_session_count().await;
        self.ctx.performance.update_session_count(active);
    }

    async fn sync_device_count(&self) {
        let connected = self.ctx.devices.len().await;
        self.ctx
            .counters
            .connected_devices
            .store(connected, Ordering::Relaxed);
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn allowed_before_hello(message_type: MessageType) -> bool {
    matches!(
        message_type,
        MessageType::Hello
            | MessageType::Ping
            | MessageType::Pong
            | MessageType::Ack
            | MessageType::Empty
    )
}

/// Same major version.
fn compatible_version(version: &str) -> bool {
    let major = |v: &str| v.split('.').next().map(str::to_string);
    major(version).is_some_and(|m| Some(m) == major(PROTOCOL_VERSION))
}

fn ack(state: &ConnectionState, message_id: String, status: &str) {
    let payload = Payload::Ack(AckPayload {
        message_id,
        status: status.to_string(),
    });
    send(state, Envelope::new(state.reply_id(), payload));
}

/// Queues `envelope` without waiting.  A full queue means the device has
/// stopped reading; the reply is dropped.
fn send(state: &ConnectionState, envelope: Envelope) {
    if let Err(e) = state.outbound.try_send(envelope) {
        warn!(
            "connection {}: reply dropped ({})",
            state.connection_id,
            match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "writer closed",
            }
        );
    }
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_follow_error_kind() {
        let malformed = DispatchError::Malformed(ProtocolError::MalformedMessage("x".into()));
        let conflict = DispatchError::Session(SessionError::SessionConflict {
            device_id: "d".into(),
            session_id: "s".into(),
        });
        let missing = DispatchError::Session(SessionError::NoActiveSession {
            device_id: "d".into(),
        });

        assert_eq!(malformed.code(), error_code::MALFORMED_MESSAGE);
        assert_eq!(conflict.code(), error_code::SESSION_CONFLICT);
        assert_eq!(missing.code(), error_code::NO_ACTIVE_SESSION);
        assert_eq!(
            DispatchError::Validation("v".into()).code(),
            error_code::VALIDATION_ERROR
        );
        assert_eq!(
            DispatchError::Connectivity("c".into()).code(),
            error_code::CONNECTIVITY_ERROR
        );
    }

    #[test]
    fn test_error_types_match_default_strategy_names() {
        let conflict = DispatchError::Session(SessionError::SessionConflict {
            device_id: "d".into(),
            session_id: "s".into(),
        });
        assert_eq!(conflict.error_type(), "SessionConflict");
        assert_eq!(conflict.category(), ErrorCategory::Session);
        assert_eq!(
            DispatchError::Connectivity("c".into()).error_type(),
            "ConnectionError"
        );
        assert_eq!(
            DispatchError::Malformed(ProtocolError::MalformedMessage("m".into())).category(),
            ErrorCategory::Protocol
        );
    }

    #[test]
    fn test_only_handshake_and_keepalive_allowed_before_hello() {
        assert!(allowed_before_hello(MessageType::Hello));
        assert!(allowed_before_hello(MessageType::Ping));
        assert!(!allowed_before_hello(MessageType::Start));
        assert!(!allowed_before_hello(MessageType::GsrData));
        assert!(!allowed_before_hello(MessageType::SyncMark));
        assert!(!allowed_before_hello(MessageType::UploadBegin));
    }

    #[test]
    fn test_upload_errors_keep_their_codes() {
        let missing = DispatchError::Upload(UploadError::NotFound("a.bin".into()));
        let disabled = DispatchError::Upload(UploadError::Disabled);
        let short = DispatchError::Upload(UploadError::SizeMismatch {
            file: "a.bin".into(),
            expected: 4,
            actual: 2,
        });

        assert_eq!(missing.code(), error_code::UPLOAD_NOT_FOUND);
        assert_eq!(disabled.code(), error_code::UPLOAD_FAILED);
        assert_eq!(short.code(), error_code::SIZE_MISMATCH);
        assert_eq!(missing.error_type(), "UploadRejected");
        assert_eq!(missing.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_protocol_version_compatibility_is_by_major() {
        assert!(compatible_version("1.0"));
        assert!(compatible_version("1.3"));
        assert!(!compatible_version("2.0"));
        assert!(!compatible_version(""));
    }
}
