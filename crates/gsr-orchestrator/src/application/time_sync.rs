//! Time Synchronization Service: per-device clock offset and drift.
//!
//! # How the estimate works (for beginners)
//!
//! Every device stamps samples with its own clock, and no two clocks agree.
//! To put all devices on one timeline the controller runs a round-trip probe:
//!
//! ```text
//! controller                      device
//!   t0 ── TIME_SYNC_REQUEST ──►
//!                                 reads its clock: d
//!   t1 ◄── TIME_SYNC_RESPONSE ──
//! ```
//!
//! Assuming the network delay is symmetric, the device read its clock at
//! controller time `t0 + rtt/2` where `rtt = t1 - t0`, so
//! `offset = (t0 + rtt/2) - d`.  Adding `offset` to any device timestamp maps
//! it to the controller's reference clock (nanoseconds since the Unix epoch).
//!
//! Short round trips have the least room for asymmetric delay, so the service
//! keeps a small window of recent probes per device and reports the one with
//! the smallest `rtt`.  The slope of offset over time across the window gives
//! the drift in parts per million.
//!
//! The service never rewrites stored samples; correction is applied by
//! readers through [`TimeSyncService::correct`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gsr_core::protocol::{
    now_epoch_ns, SequenceCounter, TimeSyncRequestPayload, TimeSyncResponsePayload,
};
use gsr_core::DeviceId;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outbound path for probes.  Implemented by the device registry.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// Devices that should be probed this round.
    async fn probe_targets(&self) -> Vec<DeviceId>;

    /// Queues `probe` for `device_id` without waiting on the socket.
    async fn send_probe(
        &self,
        device_id: &str,
        probe: TimeSyncRequestPayload,
    ) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct TimeSyncSettings {
    pub refresh_interval: Duration,
    /// Probes with a longer round trip are discarded.
    pub max_rtt: Duration,
    /// Probes kept per device.
    pub window: usize,
    /// Estimate jumps larger than this are logged.
    pub offset_threshold: Duration,
}

impl Default for TimeSyncSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            max_rtt: Duration::from_millis(500),
            window: 8,
            offset_threshold: Duration::from_millis(5),
        }
    }
}

/// Current clock estimate for one device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClockOffset {
    /// Add to a device timestamp to get reference time, nanoseconds.
    pub offset_ns: i64,
    /// Round trip of the probe the offset came from.
    pub rtt_ns: i64,
    /// Device clock drift relative to the reference, parts per million.
    pub drift_ppm: f64,
    /// Probes in the window.
    pub samples: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct ClockSample {
    /// Reference time the device clock was read, ns.
    midpoint_ns: i64,
    offset_ns: i64,
    rtt_ns: i64,
}

#[derive(Debug)]
struct PendingProbe {
    device_id: DeviceId,
    sent_ns: i64,
    sent_at: Instant,
}

#[derive(Debug, Default)]
struct SyncState {
    pending: HashMap<u64, PendingProbe>,
    clocks: HashMap<DeviceId, VecDeque<ClockSample>>,
    estimates: HashMap<DeviceId, ClockOffset>,
}

struct RefreshTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Maintains one [`ClockOffset`] per device.
pub struct TimeSyncService {
    settings: TimeSyncSettings,
    transport: Arc<dyn ProbeTransport>,
    probe_ids: SequenceCounter,
    state: Mutex<SyncState>,
    running: AtomicBool,
    task: tokio::sync::Mutex<Option<RefreshTask>>,
}

impl TimeSyncService {
    pub fn new(settings: TimeSyncSettings, transport: Arc<dyn ProbeTransport>) -> Self {
        Self {
            settings,
            transport,
            probe_ids: SequenceCounter::new(),
            state: Mutex::new(SyncState::default()),
            running: AtomicBool::new(false),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &TimeSyncSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts the periodic refresh task.  Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock().await;
        if slot.is_some() {
            return;
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let service = Arc::clone(self);
        let period = self.settings.refresh_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sent = service.probe_all().await;
                        debug!("time sync round: {sent} probe(s) sent");
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *slot = Some(RefreshTask { shutdown, handle });
        self.running.store(true, Ordering::Release);
        info!("time sync service started (every {period:?})");
    }

    /// Stops the refresh task and waits for the in-flight round to finish.
    pub async fn stop(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                warn!("time sync task ended abnormally: {e}");
            }
            info!("time sync service stopped");
        }
        self.running.store(false, Ordering::Release);
    }

    /// Latest estimate for `device_id`, if any probe has completed.
    pub fn get_offset(&self, device_id: &str) -> Option<ClockOffset> {
        self.lock().estimates.get(device_id).copied()
    }

    /// Maps a device timestamp onto the reference timeline.
    pub fn correct(&self, device_id: &str, device_ns: i64) -> Option<i64> {
        self.get_offset(device_id)
            .map(|o| device_ns.saturating_add(o.offset_ns))
    }

    /// Runs one refresh round: expires stale probes and probes every target.
    ///
    /// Returns how many probes were queued.
    pub async fn probe_all(&self) -> usize {
        self.expire_pending();
        let mut sent = 0;
        for device_id in self.transport.probe_targets().await {
            if self.probe_device(&device_id).await {
                sent += 1;
            }
        }
        sent
    }

    /// Sends one probe to `device_id`.  Returns `false` if it could not be queued.
    pub async fn probe_device(&self, device_id: &str) -> bool {
        let probe_id = self.probe_ids.next();
        let sent_ns = now_epoch_ns();
        self.lock().pending.insert(
            probe_id,
            PendingProbe {
                device_id: device_id.to_string(),
                sent_ns,
                sent_at: Instant::now(),
            },
        );

        let probe = TimeSyncRequestPayload {
            probe_id,
            reference_ns: sent_ns,
        };
        match self.transport.send_probe(device_id, probe).await {
            Ok(()) => true,
            Err(e) => {
                self.lock().pending.remove(&probe_id);
                warn!("time sync probe to {device_id} not sent: {e}");
                false
            }
        }
    }

    /// Folds a device's probe response into its estimate, received now.
    pub fn handle_response(
        &self,
        device_id: &str,
        response: &TimeSyncResponsePayload,
    ) -> Option<ClockOffset> {
        self.handle_response_at(device_id, response, now_epoch_ns())
    }

    /// Folds a probe response received at reference time `received_ns`.
    ///
    /// Unknown probes, probes answered by a different device, and round
    /// trips above `max_rtt` are discarded and return `None`.
    pub fn handle_response_at(
        &self,
        device_id: &str,
        response: &TimeSyncResponsePayload,
        received_ns: i64,
    ) -> Option<ClockOffset> {
        let mut state = self.lock();

        let Some(pending) = state.pending.remove(&response.probe_id) else {
            debug!("{device_id}: response to unknown probe {}", response.probe_id);
            return None;
        };
        if pending.device_id != device_id {
            warn!(
                "probe {} was sent to {} but answered by {device_id}",
                response.probe_id, pending.device_id
            );
            return None;
        }

        let rtt_ns = received_ns - pending.sent_ns;
        if rtt_ns < 0 || rtt_ns as u128 > self.settings.max_rtt.as_nanos() {
            debug!("{device_id}: discarding probe with rtt {rtt_ns} ns");
            return None;
        }

        let midpoint_ns = pending.sent_ns + rtt_ns / 2;
        let Some(offset_ns) = midpoint_ns.checked_sub(response.device_ns) else {
            warn!(
                "{device_id}: device clock {} ns is out of range, probe {} discarded",
                response.device_ns, response.probe_id
            );
            return None;
        };
        let window = self.settings.window.max(1);
        let samples = state.clocks.entry(device_id.to_string()).or_default();
        samples.push_back(ClockSample {
            midpoint_ns,
            offset_ns,
            rtt_ns,
        });
        while samples.len() > window {
            samples.pop_front();
        }
        let estimate = estimate(samples)?;

        if let Some(previous) = state.estimates.get(device_id) {
            let jump = estimate.offset_ns.abs_diff(previous.offset_ns);
            if u128::from(jump) > self.settings.offset_threshold.as_nanos() {
                info!("{device_id}: clock offset moved by {jump} ns");
            }
        }
        state.estimates.insert(device_id.to_string(), estimate);
        Some(estimate)
    }

    fn expire_pending(&self) {
        let timeout = self.settings.refresh_interval;
        let mut state = self.lock();
        state.pending.retain(|_, p| p.sent_at.elapsed() < timeout);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Min-RTT offset and window drift.
fn estimate(samples: &VecDeque<ClockSample>) -> Option<ClockOffset> {
    let best = samples.iter().min_by_key(|s| s.rtt_ns)?;
    let drift_ppm = match (samples.front(), samples.back()) {
        (Some(first), Some(last)) if last.midpoint_ns > first.midpoint_ns => {
            (last.offset_ns as f64 - first.offset_ns as f64)
                / (last.midpoint_ns as f64 - first.midpoint_ns as f64)
                * 1e6
        }
        _ => 0.0,
    };
    Some(ClockOffset {
        offset_ns: best.offset_ns,
        rtt_ns: best.rtt_ns,
        drift_ppm,
        samples: samples.len(),
        updated_at: Utc::now(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
