//! Performance Monitor: rolling throughput, latency, error and resource
//! metrics.
//!
//! Observability only.  Nothing on the session or connection path waits on
//! this module, and a failing resource probe simply yields zeroed readings.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ── Shared counters ───────────────────────────────────────────────────────────

/// Counters written by the connection server and read by the monitor.
#[derive(Debug, Default)]
pub struct ServerCounters {
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub errors: AtomicU64,
    pub connections_accepted: AtomicU64,
    pub connected_devices: AtomicUsize,
}

impl ServerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connected_devices: self.connected_devices.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub errors: u64,
    pub connections_accepted: u64,
    pub connected_devices: usize,
}

// ── Resource probing ──────────────────────────────────────────────────────────

/// Process-level resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub memory_percent: f64,
}

/// Source of process resource readings.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> ResourceSample;
}

/// [`ResourceProbe`] backed by `sysinfo`, reading the current process.
pub struct SysinfoProbe {
    system: sysinfo::System,
    pid: Option<sysinfo::Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("cannot determine own pid, resource metrics disabled: {e}");
                None
            }
        };
        Self {
            system: sysinfo::System::new(),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self) -> ResourceSample {
        let Some(pid) = self.pid else {
            return ResourceSample::default();
        };
        self.system.refresh_memory();
        self.system
            .refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);

        let Some(process) = self.system.process(pid) else {
            return ResourceSample::default();
        };
        let total = self.system.total_memory() as f64;
        let used = process.memory() as f64;
        ResourceSample {
            cpu_percent: f64::from(process.cpu_usage()),
            memory_mb: used / (1024.0 * 1024.0),
            memory_percent: if total > 0.0 { used / total * 100.0 } else { 0.0 },
        }
    }
}

// ── Metrics ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub memory_percent: f64,
    pub connected_devices: usize,
    pub active_sessions: usize,
    pub messages_per_second: f64,
    pub avg_response_time_ms: f64,
    pub error_rate_percent: f64,
}

/// Averages and peaks over the retained history.  All zero when empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub samples: usize,
    pub avg_cpu_percent: f64,
    pub max_cpu_percent: f64,
    pub avg_memory_mb: f64,
    pub max_memory_mb: f64,
    pub avg_messages_per_second: f64,
    pub avg_response_time_ms: f64,
    pub avg_error_rate_percent: f64,
    pub max_connected_devices: usize,
    pub current_active_sessions: usize,
    pub message_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone)]
pub struct PerformanceSettings {
    pub sample_interval: Duration,
    pub history_capacity: usize,
    pub cpu_alert_percent: f64,
    pub memory_alert_percent: f64,
    pub response_alert_ms: f64,
    pub error_alert_percent: f64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            history_capacity: 720,
            cpu_alert_percent: 80.0,
            memory_alert_percent: 80.0,
            response_alert_ms: 100.0,
            error_alert_percent: 5.0,
        }
    }
}

/// Latency samples kept for the response-time average.
const LATENCY_WINDOW: usize = 1000;

#[derive(Debug)]
struct MessageCounters {
    message_count: u64,
    error_count: u64,
    latencies_ms: VecDeque<f64>,
    since: Instant,
}

impl MessageCounters {
    fn new() -> Self {
        Self {
            message_count: 0,
            error_count: 0,
            latencies_ms: VecDeque::with_capacity(LATENCY_WINDOW),
            since: Instant::now(),
        }
    }
}

struct SamplerTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

// ── Monitor ───────────────────────────────────────────────────────────────────

pub struct PerformanceMonitor {
    settings: PerformanceSettings,
    server: Arc<ServerCounters>,
    probe: Mutex<Box<dyn ResourceProbe>>,
    counters: Mutex<MessageCounters>,
    history: Mutex<VecDeque<PerformanceMetrics>>,
    active_sessions: AtomicUsize,
    task: tokio::sync::Mutex<Option<SamplerTask>>,
}

impl PerformanceMonitor {
    pub fn new(
        settings: PerformanceSettings,
        server: Arc<ServerCounters>,
        probe: Box<dyn ResourceProbe>,
    ) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(settings.history_capacity)),
            settings,
            server,
            probe: Mutex::new(probe),
            counters: Mutex::new(MessageCounters::new()),
            active_sessions: AtomicUsize::new(0),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Records one handled message and how long it took.
    pub fn record_message(&self, latency_ms: f64, is_error: bool) {
        let mut c = lock(&self.counters);
        c.message_count += 1;
        if is_error {
            c.error_count += 1;
        }
        if c.latencies_ms.len() == LATENCY_WINDOW {
            c.latencies_ms.pop_front();
        }
        c.latencies_ms.push_back(latency_ms);
    }

    /// Zeroes message/error counts and the latency window.
    pub fn reset_counters(&self) {
        *lock(&self.counters) = MessageCounters::new();
    }

    /// `(message_count, error_count)` since the last reset.
    pub fn message_counts(&self) -> (u64, u64) {
        let c = lock(&self.counters);
        (c.message_count, c.error_count)
    }

    pub fn update_session_count(&self, active_sessions: usize) {
        self.active_sessions.store(active_sessions, Ordering::Relaxed);
    }

    /// Takes one sample into the history and returns it.
    pub fn collect(&self) -> PerformanceMetrics {
        let resources = lock(&self.probe).sample();
        let server = self.server.snapshot();

        let (messages_per_second, avg_response_time_ms, error_rate_percent) = {
            let c = lock(&self.counters);
            let elapsed = c.since.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                c.message_count as f64 / elapsed
            } else {
                0.0
            };
            let avg = if c.latencies_ms.is_empty() {
                0.0
            } else {
                c.latencies_ms.iter().sum::<f64>() / c.latencies_ms.len() as f64
            };
            let error_rate = if c.message_count == 0 {
                0.0
            } else {
                c.error_count as f64 / c.message_count as f64 * 100.0
            };
            (rate, avg, error_rate)
        };

        let metrics = PerformanceMetrics {
            timestamp: Utc::now(),
            cpu_percent: resources.cpu_percent,
            memory_mb: resources.memory_mb,
            memory_percent: resources.memory_percent,
            connected_devices: server.connected_devices,
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            messages_per_second,
            avg_response_time_ms,
            error_rate_percent,
        };
        self.check_thresholds(&metrics);

        let mut history = lock(&self.history);
        if history.len() >= self.settings.history_capacity.max(1) {
            history.pop_front();
        }
        history.push_back(metrics);
        metrics
    }

    pub fn get_latest_metrics(&self) -> Option<PerformanceMetrics> {
        lock(&self.history).back().copied()
    }

    /// Entries no older than `window`, oldest first.
    pub fn get_metrics_history(&self, window: Duration) -> Vec<PerformanceMetrics> {
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w));
        lock(&self.history)
            .iter()
            .filter(|m| cutoff.map_or(true, |c| m.timestamp >= c))
            .copied()
            .collect()
    }

    pub fn get_performance_summary(&self) -> PerformanceSummary {
        let (message_count, error_count) = self.message_counts();
        let history = lock(&self.history);
        if history.is_empty() {
            return PerformanceSummary {
                message_count,
                error_count,
                ..PerformanceSummary::default()
            };
        }

        let n = history.len() as f64;
        let avg = |f: fn(&PerformanceMetrics) -> f64| history.iter().map(f).sum::<f64>() / n;
        let max = |f: fn(&PerformanceMetrics) -> f64| history.iter().map(f).fold(0.0, f64::max);

        PerformanceSummary {
            samples: history.len(),
            avg_cpu_percent: avg(|m| m.cpu_percent),
            max_cpu_percent: max(|m| m.cpu_percent),
            avg_memory_mb: avg(|m| m.memory_mb),
            max_memory_mb: max(|m| m.memory_mb),
            avg_messages_per_second: avg(|m| m.messages_per_second),
            avg_response_time_ms: avg(|m| m.avg_response_time_ms),
            avg_error_rate_percent: avg(|m| m.error_rate_percent),
            max_connected_devices: history
                .iter()
                .map(|m| m.connected_devices)
                .max()
                .unwrap_or(0),
            current_active_sessions: history.back().map_or(0, |m| m.active_sessions),
            message_count,
            error_count,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock().await;
        if slot.is_some() {
            return;
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        let period = self.settings.sample_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let m = monitor.collect();
                        debug!(
                            "metrics: {:.1} msg/s, {:.2} ms avg, {} devices",
                            m.messages_per_second, m.avg_response_time_ms, m.connected_devices
                        );
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *slot = Some(SamplerTask { shutdown, handle });
        info!("performance monitor started (every {period:?})");
    }

    pub async fn stop(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                warn!("performance monitor ended abnormally: {e}");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    fn check_thresholds(&self, m: &PerformanceMetrics) {
        let s = &self.settings;
        if m.cpu_percent > s.cpu_alert_percent {
            warn!("high CPU usage: {:.1}%", m.cpu_percent);
        }
        if m.memory_percent > s.memory_alert_percent {
            warn!("high memory usage: {:.1}%", m.memory_percent);
        }
        if m.avg_response_time_ms > s.response_alert_ms {
            warn!("slow message handling: {:.1} ms average", m.avg_response_time_ms);
        }
        if m.error_rate_percent > s.error_alert_percent {
            warn!("high message error rate: {:.1}%", m.error_rate_percent);
        }
    }
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
