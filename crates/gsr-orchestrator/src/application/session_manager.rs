//! Session Manager: per-device recording lifecycle, sample ingest and sync
//! marks.
//!
//! # Locking model
//!
//! Each device id owns one `tokio::sync::Mutex<DeviceSlot>`.  Every operation
//! for that device (start, stop, store, mark) takes the slot lock, so a `STOP`
//! can never race a sample append on the same device.  Different devices use
//! different slots and never wait on each other.
//!
//! The outer maps (`devices`, `active_index`, `history`) are only held for
//! the duration of a lookup or insert, never across a slot lock acquisition.
//! Lock order is always *slot → index/history*, which keeps the manager free
//! of deadlocks.
//!
//! # Overlapping sessions
//!
//! A second `START` for a device that is already recording is rejected with
//! [`SessionError::SessionConflict`]; the running session is left untouched.
//!
//! # History retention
//!
//! A finished session keeps its sample buffer only until it has been
//! exported ([`SessionManager::release_samples`]) or until more than
//! [`SessionRetention::retained_sessions`] newer sessions have finished.
//! After that the history holds the session without samples plus its
//! summary.  At most [`SessionRetention::max_finished_sessions`] finished
//! sessions are remembered at all; the oldest are forgotten first.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use gsr_core::{DeviceId, Sample, Session, SessionId, SessionSummary, SyncMark};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::error_recovery::{ClassifiedError, ErrorCategory};

/// Session-lifecycle misuse.  Reported to the caller, never fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The device already has a session in `RECORDING`.
    #[error("device {device_id} already has active session {session_id}")]
    SessionConflict {
        device_id: DeviceId,
        session_id: SessionId,
    },

    /// The device has no session in `RECORDING`.
    #[error("no active session for device {device_id}")]
    NoActiveSession { device_id: DeviceId },
}

impl ClassifiedError for SessionError {
    fn error_type(&self) -> &'static str {
        match self {
            SessionError::SessionConflict { .. } => "SessionConflict",
            SessionError::NoActiveSession { .. } => "NoActiveSession",
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Session
    }
}

#[derive(Debug, Default)]
struct DeviceSlot {
    active: Option<Session>,
}

/// Bounds on the finished-session history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRetention {
    /// Finished sessions whose samples stay in memory.
    pub retained_sessions: usize,
    /// Finished sessions remembered at all, with or without samples.
    pub max_finished_sessions: usize,
}

impl Default for SessionRetention {
    fn default() -> Self {
        Self {
            retained_sessions: 16,
            max_finished_sessions: 10_000,
        }
    }
}

#[derive(Debug)]
struct FinishedSession {
    /// Taken before the samples were released, so counts stay accurate.
    summary: SessionSummary,
    session: Arc<Session>,
    has_samples: bool,
}

/// Finished sessions, immutable apart from releasing their samples.
#[derive(Debug, Default)]
struct History {
    entries: HashMap<SessionId, FinishedSession>,
    /// Ids still holding samples, oldest first.
    with_samples: VecDeque<SessionId>,
    /// Every id, oldest first.
    order: VecDeque<SessionId>,
}

impl History {
    fn insert(&mut self, session: Arc<Session>, retention: SessionRetention) {
        let id = session.id.clone();
        let entry = FinishedSession {
            summary: session.summary(),
            session,
            has_samples: true,
        };
        self.entries.insert(id.clone(), entry);
        self.with_samples.push_back(id.clone());
        self.order.push_back(id);

        while self.with_samples.len() > retention.retained_sessions {
            if let Some(oldest) = self.with_samples.pop_front() {
                self.strip(&oldest);
            }
        }
        while self.order.len() > retention.max_finished_sessions {
            if let Some(oldest) = self.order.pop_front() {
                if self.entries.remove(&oldest).is_some_and(|e| e.has_samples) {
                    self.with_samples.retain(|id| *id != oldest);
                }
            }
        }
    }

    fn release(&mut self, session_id: &str) -> bool {
        let holding = self
            .entries
            .get(session_id)
            .is_some_and(|e| e.has_samples);
        if holding {
            self.with_samples.retain(|id| id != session_id);
            self.strip(session_id);
        }
        holding
    }

    fn strip(&mut self, session_id: &str) {
        if let Some(entry) = self.entries.get_mut(session_id) {
            entry.session = Arc::new(entry.session.without_samples());
            entry.has_samples = false;
        }
    }
}

/// Owns every session, active and historical.
pub struct SessionManager {
    devices: RwLock<HashMap<DeviceId, Arc<Mutex<DeviceSlot>>>>,
    /// Active session id → owning device.
    active_index: RwLock<HashMap<SessionId, DeviceId>>,
    history: RwLock<History>,
    retention: SessionRetention,
    /// Zero point of the controller monotonic clock used for sync marks.
    epoch: Instant,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_retention(SessionRetention::default())
    }

    pub fn with_retention(retention: SessionRetention) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            active_index: RwLock::new(HashMap::new()),
            history: RwLock::new(History::default()),
            retention,
            epoch: Instant::now(),
        }
    }

    /// Creates a new `RECORDING` session for `device_id`.
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionConflict`] if the device is already recording.
    pub async fn start_session(
        &self,
        device_id: &str,
        name: &str,
        participant_id: Option<String>,
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    ) -> Result<SessionId, SessionError> {
        let slot = self.slot(device_id).await;
        let mut slot = slot.lock().await;

        if let Some(active) = &slot.active {
            return Err(SessionError::SessionConflict {
                device_id: device_id.to_string(),
                session_id: active.id.clone(),
            });
        }

        let session_id = new_session_id(device_id);
        let session = Session::start(
            session_id.clone(),
            device_id,
            name,
            participant_id,
            metadata.unwrap_or_default(),
        );
        self.active_index
            .write()
            .await
            .insert(session_id.clone(), device_id.to_string());
        slot.active = Some(session);

        info!("session {session_id} started for device {device_id} ('{name}')");
        Ok(session_id)
    }

    /// Finishes the active session and moves it to the historical registry.
    ///
    /// Returns the finished session with all of its samples, even when the
    /// history keeps none of them.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoActiveSession`] if the device is not recording.
    pub async fn stop_session(&self, device_id: &str) -> Result<Arc<Session>, SessionError> {
        let slot = self
            .existing_slot(device_id)
            .await
            .ok_or_else(|| no_active(device_id))?;
        let mut slot = slot.lock().await;

        let mut session = slot.active.take().ok_or_else(|| no_active(device_id))?;
        if let Err(e) = session.finish() {
            warn!("stopping session for {device_id}: {e}");
        }
        let session = Arc::new(session);

        // History first, so a concurrent lookup by id always finds it somewhere.
        self.history
            .write()
            .await
            .insert(Arc::clone(&session), self.retention);
        self.active_index.write().await.remove(&session.id);

        info!(
            "session {} stopped for device {device_id}: {} samples, {} sync marks, {} missing",
            session.id,
            session.samples.len(),
            session.sync_marks.len(),
            session.quality.missing_samples
        );
        Ok(session)
    }

    /// Appends `samples` to the device's active session in arrival order.
    ///
    /// Sequence gaps are recorded on the session and never rejected.
    /// Returns the number of samples appended.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoActiveSession`] if the device is not recording;
    /// nothing is appended in that case.
    pub async fn store_samples(
        &self,
        device_id: &str,
        samples: Vec<Sample>,
    ) -> Result<usize, SessionError> {
        let slot = self
            .existing_slot(device_id)
            .await
            .ok_or_else(|| no_active(device_id))?;
        let mut slot = slot.lock().await;
        let session = slot.active.as_mut().ok_or_else(|| no_active(device_id))?;

        let gaps_before = session.quality.gaps.len();
        let stored = session
            .append_samples(samples)
            .map_err(|_| no_active(device_id))?;
        let new_gaps = session.quality.gaps.len() - gaps_before;
        if new_gaps > 0 {
            debug!(
                "device {device_id}: {new_gaps} sequence gap(s) in batch, {} missing so far",
                session.quality.missing_samples
            );
        }
        Ok(stored)
    }

    /// Appends a sync mark stamped with the controller's clocks.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoActiveSession`] if the device is not recording.
    pub async fn record_sync_mark(
        &self,
        device_id: &str,
        mark_id: &str,
        description: &str,
    ) -> Result<SyncMark, SessionError> {
        let slot = self
            .existing_slot(device_id)
            .await
            .ok_or_else(|| no_active(device_id))?;
        let mut slot = slot.lock().await;
        let session = slot.active.as_mut().ok_or_else(|| no_active(device_id))?;

        let mark = SyncMark {
            mark_id: mark_id.to_string(),
            description: description.to_string(),
            wall_clock: Utc::now(),
            monotonic_ns: self.epoch.elapsed().as_nanos() as u64,
        };
        session
            .add_sync_mark(mark.clone())
            .map_err(|_| no_active(device_id))?;
        debug!("device {device_id}: sync mark '{mark_id}' recorded");
        Ok(mark)
    }

    /// Notes a completed upload on the device's active session.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoActiveSession`] if the device is not recording.
    pub async fn record_upload(
        &self,
        device_id: &str,
        file_name: &str,
    ) -> Result<(), SessionError> {
        let slot = self
            .existing_slot(device_id)
            .await
            .ok_or_else(|| no_active(device_id))?;
        let mut slot = slot.lock().await;
        let session = slot.active.as_mut().ok_or_else(|| no_active(device_id))?;
        session
            .add_uploaded_file(file_name)
            .map_err(|_| no_active(device_id))
    }

    /// Drops the sample buffer of a finished session, typically once it has
    /// been exported.  Returns `false` if the session is unknown or already
    /// released.
    pub async fn release_samples(&self, session_id: &str) -> bool {
        let released = self.history.write().await.release(session_id);
        if released {
            debug!("session {session_id}: samples released from memory");
        }
        released
    }

    // ── Read-only lookups ─────────────────────────────────────────────────────

    /// Id of the device's active session.
    pub async fn active_session_id(&self, device_id: &str) -> Option<SessionId> {
        let slot = self.existing_slot(device_id).await?;
        let slot = slot.lock().await;
        slot.active.as_ref().map(|s| s.id.clone())
    }

    /// Snapshot of the device's active session.
    pub async fn get_active_session(&self, device_id: &str) -> Option<Session> {
        let slot = self.existing_slot(device_id).await?;
        let slot = slot.lock().await;
        slot.active.clone()
    }

    /// Looks a session up by id in both the active and historical registries.
    ///
    /// A finished session whose samples were released comes back with an
    /// empty `samples` buffer; [`Self::get_session_summary`] still has the
    /// count.
    pub async fn get_session_by_id(&self, session_id: &str) -> Option<Session> {
        if let Some(done) = self.history.read().await.entries.get(session_id) {
            return Some(Session::clone(&done.session));
        }

        let owner = self.active_index.read().await.get(session_id).cloned();
        if let Some(device_id) = owner {
            if let Some(slot) = self.existing_slot(&device_id).await {
                let slot = slot.lock().await;
                if let Some(active) = slot.active.as_ref().filter(|s| s.id == session_id) {
                    return Some(active.clone());
                }
            }
        }

        // It may have been stopped between the two lookups above.
        self.history
            .read()
            .await
            .entries
            .get(session_id)
            .map(|done| Session::clone(&done.session))
    }

    /// Summary of an active or finished session, without copying samples.
    pub async fn get_session_summary(&self, session_id: &str) -> Option<SessionSummary> {
        if let Some(done) = self.history.read().await.entries.get(session_id) {
            return Some(done.summary.clone());
        }

        let owner = self.active_index.read().await.get(session_id).cloned();
        if let Some(device_id) = owner {
            if let Some(slot) = self.existing_slot(&device_id).await {
                let slot = slot.lock().await;
                if let Some(active) = slot.active.as_ref().filter(|s| s.id == session_id) {
                    return Some(active.summary());
                }
            }
        }

        self.history
            .read()
            .await
            .entries
            .get(session_id)
            .map(|done| done.summary.clone())
    }

    /// Summaries of every recording session, ordered by device id.
    pub async fn list_active_sessions(&self) -> Vec<SessionSummary> {
        let slots: Vec<Arc<Mutex<DeviceSlot>>> =
            self.devices.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for slot in slots {
            if let Some(active) = &slot.lock().await.active {
                out.push(active.summary());
            }
        }
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    /// Summaries of every session, active and finished, oldest first.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut out = self.list_active_sessions().await;
        out.extend(
            self.history
                .read()
                .await
                .entries
                .values()
                .map(|done| done.summary.clone()),
        );
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn active_session_count(&self) -> usize {
        self.active_index.read().await.len()
    }

    // ── Private helpers ───────────────────────────────────────────────────────

    async fn existing_slot(&self, device_id: &str) -> Option<Arc<Mutex<DeviceSlot>>> {
        self.devices.read().await.get(device_id).cloned()
    }

    async fn slot(&self, device_id: &str) -> Arc<Mutex<DeviceSlot>> {
        if let Some(slot) = self.existing_slot(device_id).await {
            return slot;
        }
        Arc::clone(
            self.devices
                .write()
                .await
                .entry(device_id.to_string())
                .or_default(),
        )
    }
}

fn no_active(device_id: &str) -> SessionError {
    SessionError::NoActiveSession {
        device_id: device_id.to_string(),
    }
}

/// `{device}_{epoch ms}_{8 hex}`; the random suffix keeps ids unique when a
/// device restarts within the same millisecond.
fn new_session_id(device_id: &str) -> SessionId {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{device_id}_{}_{}",
        Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
