//! Error Recovery Manager: classify failures and drive recovery strategies.
//!
//! Every handler failure in the connection server ends up here.  For each
//! reported error the manager:
//!
//! 1. Classifies a [`Severity`] from the error's [`ErrorCategory`].
//! 2. Looks up the **first** registered [`RecoveryStrategy`] whose pattern
//!    matches `"{ErrorType}: {message}"` (first-match, not best-match).
//! 3. Walks the strategy's action list, publishing one [`RecoveryEvent`] per
//!    dispatched action to every subscriber of the reporting service.
//! 4. Returns a [`RecoveryOutcome`] telling the caller what happened.
//!
//! # Why channels instead of callbacks? (for beginners)
//!
//! A callback runs on the caller's stack: a slow or panicking callback would
//! stall the connection task that reported the error.  Instead each
//! subscriber receives an `mpsc::Receiver<RecoveryEvent>` and consumes events
//! on its own task.  Publishing uses `try_send`, so a full subscriber queue
//! drops the event (with a warning) rather than blocking the reporter.
//!
//! Retry events carry the back-off delay in [`RecoveryEvent::retry_after`];
//! `handle_error` itself never sleeps.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gsr_core::MessageType;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ── Classification ────────────────────────────────────────────────────────────

/// Closed severity scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Broad family an error belongs to; drives the default severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCategory {
    Connectivity,
    Protocol,
    Session,
    Validation,
    Resource,
    Internal,
}

impl ErrorCategory {
    /// Severity used when no strategy overrides it.
    pub fn default_severity(self) -> Severity {
        match self {
            ErrorCategory::Connectivity => Severity::High,
            ErrorCategory::Protocol => Severity::Medium,
            ErrorCategory::Session => Severity::Low,
            ErrorCategory::Validation => Severity::Low,
            ErrorCategory::Resource => Severity::Critical,
            ErrorCategory::Internal => Severity::Medium,
        }
    }
}

/// An error the recovery manager knows how to classify.
pub trait ClassifiedError: std::error::Error + Send + Sync {
    /// Stable type name matched by strategy patterns (e.g. `"ConnectionError"`).
    fn error_type(&self) -> &'static str;

    fn category(&self) -> ErrorCategory;
}

// ── Strategies ────────────────────────────────────────────────────────────────

/// One step of a recovery plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryAction {
    Retry,
    Reconnect,
    RestartService,
    ResetState,
    Escalate,
    Ignore,
}

/// Extra conditions a strategy requires besides its pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyConditions {
    /// Only match errors reported by this service.
    pub service: Option<String>,
    /// Only match errors of this category.
    pub category: Option<ErrorCategory>,
}

/// Maps an error pattern to a severity and an ordered action plan.
#[derive(Debug, Clone)]
pub struct RecoveryStrategy {
    pattern: Regex,
    pub severity: Severity,
    pub actions: Vec<RecoveryAction>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub conditions: StrategyConditions,
}

impl RecoveryStrategy {
    /// Creates a strategy with one retry, a 1 s delay and doubling back-off.
    ///
    /// # Errors
    ///
    /// Returns the regex compile error when `pattern` is invalid.
    pub fn new(
        pattern: &str,
        severity: Severity,
        actions: Vec<RecoveryAction>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            severity,
            actions,
            max_retries: 1,
            retry_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            conditions: StrategyConditions::default(),
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, retry_delay: Duration, multiplier: f64) -> Self {
        self.retry_delay = retry_delay;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_conditions(mut self, conditions: StrategyConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        self.retry_delay
            .mul_f64(self.backoff_multiplier.max(1.0).powi(exponent))
    }

    fn matches(&self, subject: &str, service: &str, category: ErrorCategory) -> bool {
        if let Some(required) = &self.conditions.service {
            if required != service {
                return false;
            }
        }
        if let Some(required) = self.conditions.category {
            if required != category {
                return false;
            }
        }
        self.pattern.is_match(subject)
    }
}

// ── Events and outcomes ───────────────────────────────────────────────────────

/// Where an error happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub device_id: Option<String>,
    pub message_type: Option<MessageType>,
}

impl ErrorContext {
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            message_type: None,
        }
    }
}

/// Published to subscribers of the reporting service.
#[derive(Debug, Clone)]
pub struct RecoveryEvent {
    pub service: String,
    pub error_type: &'static str,
    pub message: String,
    pub severity: Severity,
    pub context: ErrorContext,
    /// Matched strategy, `None` for an unhandled error report.
    pub strategy: Option<String>,
    /// Action being requested, `None` for an unhandled error report.
    pub action: Option<RecoveryAction>,
    /// 1-based retry number for [`RecoveryAction::Retry`].
    pub attempt: u32,
    /// Back-off the subscriber should wait before retrying.
    pub retry_after: Option<Duration>,
}

/// Final state of one `handle_error` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Resolution {
    /// Retry/restart/reset actions reached at least one subscriber.
    Recovering,
    /// The connection should be dropped so the device reconnects.
    Reconnect,
    /// Handed to an operator; terminal.
    Escalated,
    /// Strategy says the error needs no action.
    Ignored,
    /// No strategy matched or nothing could be dispatched; terminal.
    Unhandled,
}

impl Resolution {
    pub fn is_terminal(self) -> bool {
        matches!(self, Resolution::Escalated | Resolution::Unhandled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub severity: Severity,
    pub strategy: Option<String>,
    /// Retry events dispatched.
    pub attempts: u32,
    /// Retry/restart/reset events no subscriber received.
    pub undelivered: u32,
    pub actions: Vec<RecoveryAction>,
    pub resolution: Resolution,
}

impl RecoveryOutcome {
    pub fn should_disconnect(&self) -> bool {
        self.resolution == Resolution::Reconnect
    }
}

/// Aggregate counters; a monitoring snapshot, not an audit log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub timestamp: DateTime<Utc>,
    pub total_errors: u64,
    pub by_severity: BTreeMap<Severity, u64>,
    pub by_service: BTreeMap<String, u64>,
    pub recovered: u64,
    pub terminal: u64,
    pub recovery_rate: f64,
    /// Recovery actions published with no subscriber listening.
    pub undelivered_actions: u64,
    pub recent_errors: usize,
}

/// Result of one monitoring sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSweep {
    pub recent_errors: usize,
    pub high_error_rate: bool,
    pub noisy_services: Vec<String>,
}

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub monitor_interval: Duration,
    /// Errors older than this are dropped from the rate window.
    pub rate_window: Duration,
    pub error_rate_threshold: usize,
    pub service_rate_threshold: usize,
    /// Queue depth of each subscriber channel.
    pub subscriber_capacity: usize,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(30),
            rate_window: Duration::from_secs(3600),
            error_rate_threshold: 10,
            service_rate_threshold: 5,
            subscriber_capacity: 64,
        }
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RecoveryStats {
    total: u64,
    by_severity: BTreeMap<Severity, u64>,
    by_service: BTreeMap<String, u64>,
    recovered: u64,
    terminal: u64,
    undelivered_actions: u64,
}

struct MonitorTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Classifies reported errors and dispatches recovery plans.
///
/// Strategy and subscriber tables are append/lookup only.
pub struct ErrorRecoveryManager {
    settings: RecoverySettings,
    strategies: RwLock<Vec<(String, Arc<RecoveryStrategy>)>>,
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<RecoveryEvent>>>>,
    stats: Mutex<RecoveryStats>,
    recent: Mutex<VecDeque<(Instant, String)>>,
    monitor: tokio::sync::Mutex<Option<MonitorTask>>,
}

impl fmt::Debug for ErrorRecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorRecoveryManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ErrorRecoveryManager {
    /// Creates a manager with no strategies.
    pub fn new(settings: RecoverySettings) -> Self {
        Self {
            settings,
            strategies: RwLock::new(Vec::new()),
            subscribers: RwLock::new(HashMap::new()),
            stats: Mutex::new(RecoveryStats::default()),
            recent: Mutex::new(VecDeque::new()),
            monitor: tokio::sync::Mutex::new(None),
        }
    }

    /// Creates a manager seeded with the built-in strategy set.
    ///
    /// Order matters: the narrow, anchored patterns come first so that a
    /// validation message mentioning "connection" is not treated as a
    /// transport failure.
    pub fn with_default_strategies(settings: RecoverySettings) -> Self {
        let manager = Self::new(settings);
        for (name, strategy) in default_strategies() {
            manager.add_recovery_strategy(name, strategy);
        }
        manager
    }

    /// Appends a strategy.  Registering a name twice keeps both entries.
    pub fn add_recovery_strategy(&self, name: impl Into<String>, strategy: RecoveryStrategy) {
        let name = name.into();
        debug!("registering recovery strategy '{name}' /{}/", strategy.pattern());
        write(&self.strategies).push((name, Arc::new(strategy)));
    }

    /// Subscribes to recovery events for `service`.
    ///
    /// Any number of subscribers per service is supported; each receives
    /// every event.
    pub fn register_error_callback(
        &self,
        service: impl Into<String>,
    ) -> mpsc::Receiver<RecoveryEvent> {
        let (tx, rx) = mpsc::channel(self.settings.subscriber_capacity.max(1));
        write(&self.subscribers)
            .entry(service.into())
            .or_default()
            .push(tx);
        rx
    }

    pub fn strategy_names(&self) -> Vec<String> {
        read(&self.strategies)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Classifies `err`, runs the first matching strategy and reports the
    /// outcome.  Never blocks and never sleeps.
    pub fn handle_error(
        &self,
        err: &dyn ClassifiedError,
        service: &str,
        context: ErrorContext,
    ) -> RecoveryOutcome {
        let error_type = err.error_type();
        let category = err.category();
        let message = err.to_string();
        let subject = format!("{error_type}: {message}");

        let matched = read(&self.strategies)
            .iter()
            .find(|(_, s)| s.matches(&subject, service, category))
            .map(|(name, s)| (name.clone(), Arc::clone(s)));

        let base = RecoveryEvent {
            service: service.to_string(),
            error_type,
            message,
            severity: category.default_severity(),
            context,
            strategy: None,
            action: None,
            attempt: 0,
            retry_after: None,
        };

        let outcome = match matched {
            None => {
                self.publish(base.clone());
                RecoveryOutcome {
                    severity: base.severity,
                    strategy: None,
                    attempts: 0,
                    undelivered: 0,
                    actions: Vec::new(),
                    resolution: Resolution::Unhandled,
                }
            }
            Some((name, strategy)) => {
                let base = RecoveryEvent {
                    severity: strategy.severity,
                    strategy: Some(name.clone()),
                    ..base.clone()
                };
                self.execute(&name, &strategy, &base)
            }
        };

        self.record(service, &outcome);
        log_outcome(&subject, service, &base.context, &outcome);
        outcome
    }

    /// Aggregate counters plus the current time.
    pub fn get_error_report(&self) -> ErrorReport {
        let recent_errors = lock(&self.recent).len();
        let stats = lock(&self.stats);
        let handled = stats.recovered + stats.terminal;
        ErrorReport {
            timestamp: Utc::now(),
            total_errors: stats.total,
            by_severity: stats.by_severity.clone(),
            by_service: stats.by_service.clone(),
            recovered: stats.recovered,
            terminal: stats.terminal,
            recovery_rate: if handled == 0 {
                0.0
            } else {
                stats.recovered as f64 / handled as f64
            },
            undelivered_actions: stats.undelivered_actions,
            recent_errors,
        }
    }

    /// Prunes the rate window and warns about error bursts.
    pub fn sweep(&self) -> HealthSweep {
        let mut recent = lock(&self.recent);
        let window = self.settings.rate_window;
        while recent
            .front()
            .is_some_and(|(at, _)| at.elapsed() > window)
        {
            recent.pop_front();
        }

        let mut per_service: BTreeMap<&str, usize> = BTreeMap::new();
        for (_, service) in recent.iter() {
            *per_service.entry(service.as_str()).or_default() += 1;
        }

        let high_error_rate = recent.len() > self.settings.error_rate_threshold;
        if high_error_rate {
            warn!(
                "high error rate: {} errors in the last {:?}",
                recent.len(),
                window
            );
        }
        let noisy_services: Vec<String> = per_service
            .into_iter()
            .filter(|(_, n)| *n > self.settings.service_rate_threshold)
            .map(|(service, n)| {
                warn!("service '{service}' reported {n} errors in the last {window:?}");
                service.to_string()
            })
            .collect();

        HealthSweep {
            recent_errors: recent.len(),
            high_error_rate,
            noisy_services,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Starts the periodic monitoring loop.  Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().await;
        if slot.is_some() {
            return;
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let period = self.settings.monitor_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep();
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("error recovery monitor stopped");
        });
        *slot = Some(MonitorTask { shutdown, handle });
        info!("error recovery monitor started (every {period:?})");
    }

    /// Stops the monitoring loop and waits for it to finish.
    pub async fn stop(&self) {
        let task = self.monitor.lock().await.take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                warn!("error recovery monitor ended abnormally: {e}");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.monitor.lock().await.is_some()
    }

    // ── Private helpers ───────────────────────────────────────────────────────

    fn execute(
        &self,
        name: &str,
        strategy: &RecoveryStrategy,
        base: &RecoveryEvent,
    ) -> RecoveryOutcome {
        let mut attempts = 0;
        let mut undelivered = 0;
        let mut actions = Vec::new();
        let mut resolution: Option<Resolution> = None;

        // Retry/restart/reset only count as recovering when someone is
        // subscribed to act on them.
        for &action in &strategy.actions {
            match action {
                RecoveryAction::Retry => {
                    for attempt in 1..=strategy.max_retries {
                        attempts += 1;
                        actions.push(action);
                        let delivered = self.publish(RecoveryEvent {
                            action: Some(action),
                            attempt,
                            retry_after: Some(strategy.backoff_delay(attempt)),
                            ..base.clone()
                        });
                        if delivered {
                            resolution.get_or_insert(Resolution::Recovering);
                        } else {
                            undelivered += 1;
                        }
                    }
                }
                RecoveryAction::RestartService | RecoveryAction::ResetState => {
                    actions.push(action);
                    let delivered = self.publish(RecoveryEvent {
                        action: Some(action),
                        ..base.clone()
                    });
                    if delivered {
                        resolution.get_or_insert(Resolution::Recovering);
                    } else {
                        undelivered += 1;
                    }
                }
                RecoveryAction::Reconnect => {
                    actions.push(action);
                    self.publish(RecoveryEvent {
                        action: Some(action),
                        ..base.clone()
                    });
                    resolution = Some(Resolution::Reconnect);
                }
                RecoveryAction::Escalate => {
                    actions.push(action);
                    self.publish(RecoveryEvent {
                        action: Some(action),
                        ..base.clone()
                    });
                    resolution = Some(Resolution::Escalated);
                    break;
                }
                RecoveryAction::Ignore => {
                    actions.push(action);
                    resolution.get_or_insert(Resolution::Ignored);
                    break;
                }
            }
        }

        if undelivered > 0 {
            debug!(
                "strategy '{name}': {undelivered} action(s) for '{}' had no subscriber",
                base.service
            );
        }
        RecoveryOutcome {
            severity: strategy.severity,
            strategy: Some(name.to_string()),
            attempts,
            undelivered,
            actions,
            resolution: resolution.unwrap_or(Resolution::Unhandled),
        }
    }

    /// Returns whether at least one subscriber queued the event.
    fn publish(&self, event: RecoveryEvent) -> bool {
        let subscribers = read(&self.subscribers);
        let Some(senders) = subscribers.get(&event.service) else {
            return false;
        };
        let mut delivered = false;
        for tx in senders {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered = true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("recovery subscriber for '{}' is full; event dropped", event.service);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("recovery subscriber for '{}' has gone away", event.service);
                }
            }
        }
        delivered
    }

    fn record(&self, service: &str, outcome: &RecoveryOutcome) {
        {
            let mut stats = lock(&self.stats);
            stats.total += 1;
            *stats.by_severity.entry(outcome.severity).or_default() += 1;
            *stats.by_service.entry(service.to_string()).or_default() += 1;
            stats.undelivered_actions += u64::from(outcome.undelivered);
            if outcome.resolution.is_terminal() {
                stats.terminal += 1;
            } else {
                stats.recovered += 1;
            }
        }
        lock(&self.recent).push_back((Instant::now(), service.to_string()));
    }
}

fn log_outcome(subject: &str, service: &str, context: &ErrorContext, outcome: &RecoveryOutcome) {
    let device = context.device_id.as_deref().unwrap_or("-");
    let strategy = outcome.strategy.as_deref().unwrap_or("none");
    match outcome.resolution {
        Resolution::Escalated | Resolution::Unhandled => error!(
            "[{service}] device={device} {subject} -> {:?} (strategy={strategy}, severity={:?})",
            outcome.resolution, outcome.severity
        ),
        Resolution::Reconnect | Resolution::Recovering => warn!(
            "[{service}] device={device} {subject} -> {:?} after {} retries (strategy={strategy})",
            outcome.resolution, outcome.attempts
        ),
        Resolution::Ignored => debug!("[{service}] device={device} {subject} ignored"),
    }
}

/// Built-in strategies, in lookup order.
fn default_strategies() -> Vec<(&'static str, RecoveryStrategy)> {
    let table: [(&str, &str, Severity, Vec<RecoveryAction>, u32, u64, f64); 7] = [
        (
            "protocol",
            r"^MalformedMessage",
            Severity::Medium,
            vec![RecoveryAction::Ignore],
            0,
            0,
            1.0,
        ),
        (
            "validation",
            r"^ValidationError",
            Severity::Low,
            vec![RecoveryAction::Ignore],
            0,
            0,
            1.0,
        ),
        (
            "session",
            r"^(SessionConflict|NoActiveSession)",
            Severity::Low,
            vec![RecoveryAction::Ignore],
            0,
            0,
            1.0,
        ),
        (
            "connection",
            r"(?i)^ConnectionError|websocket|network|timed out",
            Severity::High,
            vec![RecoveryAction::Retry, RecoveryAction::Reconnect],
            3,
            2000,
            1.5,
        ),
        (
            "upload",
            r"^UploadRejected",
            Severity::Low,
            vec![RecoveryAction::Ignore],
            0,
            0,
            1.0,
        ),
        (
            "file_io",
            r"(?i)\b(file|i/o|permission)\b",
            Severity::Low,
            vec![RecoveryAction::Retry, RecoveryAction::Escalate],
            3,
            1000,
            2.0,
        ),
        (
            "resource",
            r"(?i)memory|resource|out of",
            Severity::Critical,
            vec![RecoveryAction::ResetState, RecoveryAction::Escalate],
            1,
            5000,
            1.0,
        ),
    ];

    table
        .into_iter()
        .filter_map(|(name, pattern, severity, actions, retries, delay_ms, backoff)| {
            match RecoveryStrategy::new(pattern, severity, actions) {
                Ok(s) => Some((
                    name,
                    s.with_max_retries(retries)
                        .with_backoff(Duration::from_millis(delay_ms), backoff),
                )),
                Err(e) => {
                    error!("built-in strategy '{name}' has an invalid pattern: {e}");
                    None
                }
            }
        })
        .collect()
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestError {
        kind: &'static str,
        category: ErrorCategory,
        message: String,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.message)
        }
    }

    impl std::error::Error for TestError {}

    impl ClassifiedError for TestError {
        fn error_type(&self) -> &'static str {
            self.kind
        }
        fn category(&self) -> ErrorCategory {
            self.category
        }
    }

    fn connection_error() -> TestError {
        TestError {
            kind: "ConnectionError",
            category: ErrorCategory::Connectivity,
            message: "connection reset by peer".to_string(),
        }
    }

    fn connection_strategy() -> RecoveryStrategy {
        RecoveryStrategy::new(
            "ConnectionError.*",
            Severity::High,
            vec![RecoveryAction::Retry, RecoveryAction::Reconnect],
        )
        .unwrap()
        .with_max_retries(3)
        .with_backoff(Duration::from_millis(100), 2.0)
    }

    fn drain(rx: &mut mpsc::Receiver<RecoveryEvent>) -> Vec<RecoveryEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn test_matching_strategy_retries_up_to_max_retries() {
        // Arrange
        let manager = ErrorRecoveryManager::new(RecoverySettings::default());
        manager.add_recovery_strategy("conn", connection_strategy());
        let mut rx = manager.register_error_callback("connection_server");

        // Act
        let outcome = manager.handle_error(
            &connection_error(),
            "connection_server",
            ErrorContext::for_device("d1"),
        );

        // Assert
        assert_eq!(outcome.strategy.as_deref(), Some("conn"));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.resolution, Resolution::Reconnect);
        assert!(outcome.should_disconnect());

        let events = drain(&mut rx);
        let retries: Vec<_> = events
            .iter()
            .filter(|e| e.action == Some(RecoveryAction::Retry))
            .collect();
        assert_eq!(retries.len(), 3);
        assert_eq!(
            retries.iter().map(|e| e.retry_after.unwrap()).collect::<Vec<_>>(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert_eq!(events.last().unwrap().action, Some(RecoveryAction::Reconnect));
    }

    #[test]
    fn test_unmatched_error_uses_default_severity_without_retry() {
        // Arrange
        let manager = ErrorRecoveryManager::new(RecoverySettings::default());
        manager.add_recovery_strategy("conn", connection_strategy());
        let err = TestError {
            kind: "ValidationError",
            category: ErrorCategory::Validation,
            message: "battery level out of range".to_string(),
        };

        // Act
        let outcome = manager.handle_error(&err, "connection_server", ErrorContext::default());

        // Assert
        assert_eq!(outcome.strategy, None);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.severity, Severity::Low);
        assert_eq!(outcome.resolution, Resolution::Unhandled);
        assert!(outcome.resolution.is_terminal());
    }

    #[test]
    fn test_first_registered_match_wins() {
        let manager = ErrorRecoveryManager::new(RecoverySettings::default());
        manager.add_recovery_strategy(
            "broad",
            RecoveryStrategy::new("Error", Severity::Medium, vec![RecoveryAction::Ignore]).unwrap(),
        );
        manager.add_recovery_strategy("conn", connection_strategy());

        let outcome =
            manager.handle_error(&connection_error(), "svc", ErrorContext::default());

        assert_eq!(outcome.strategy.as_deref(), Some("broad"));
        assert_eq!(outcome.resolution, Resolution::Ignored);
        assert_eq!(outcome.severity, Severity::Medium);
    }

    #[test]
    fn test_duplicate_strategy_names_are_both_kept() {
        let manager = ErrorRecoveryManager::new(RecoverySettings::default());
        manager.add_recovery_strategy("conn", connection_strategy());
        manager.add_recovery_strategy("conn", connection_strategy());
        assert_eq!(manager.strategy_names(), vec!["conn", "conn"]);
    }

    #[test]
    fn test_service_condition_restricts_match() {
        let manager = ErrorRecoveryManager::new(RecoverySettings::default());
        manager.add_recovery_strategy(
            "storage-only",
            connection_strategy().with_conditions(StrategyConditions {
                service: Some("storage".to_string()),
                category: None,
            }),
        );

        let outcome =
            manager.handle_error(&connection_error(), "connection_server", ErrorContext::default());

        assert_eq!(outcome.strategy, None);
    }

    #[test]
    fn test_every_subscriber_of_a_service_receives_events() {
        // Arrange
        let manager = ErrorRecoveryManager::new(RecoverySettings::default());
        manager.add_recovery_strategy("conn", connection_strategy());
        let mut first = manager.register_error_callback("svc");
        let mut second = manager.register_error_callback("svc");
        let mut other = manager.register_error_callback("other");

        // Act
        manager.handle_error(&connection_error(), "svc", ErrorContext::default());

        // Assert
        assert_eq!(drain(&mut first).len(), 4);
        assert_eq!(drain(&mut second).len(), 4);
        assert!(drain(&mut other).is_empty());
    }

    #[test]
    fn test_full_subscriber_does_not_block_handling() {
        let manager = ErrorRecoveryManager::new(RecoverySettings {
            subscriber_capacity: 1,
            ..RecoverySettings::default()
        });
        manager.add_recovery_strategy("conn", connection_strategy());
        let mut rx = manager.register_error_callback("svc");

        let outcome = manager.handle_error(&connection_error(), "svc", ErrorContext::default());

        assert_eq!(outcome.attempts, 3);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_escalate_stops_the_plan_and_is_terminal() {
        let manager = ErrorRecoveryManager::new(RecoverySettings::default());
        manager.add_recovery_strategy(
            "esc",
            RecoveryStrategy::new(
                "ConnectionError",
                Severity::Critical,
                vec![
                    RecoveryAction::Escalate,
                    RecoveryAction::Retry,
                ],
            )
            .unwrap()
            .with_max_retries(5),
        );

        let outcome = manager.handle_error(&connection_error(), "svc", ErrorContext::default());

        assert_eq!(outcome.resolution, Resolution::Escalated);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.actions, vec![RecoveryAction::Escalate]);
    }

    #[test]
    fn test_error_report_counts_by_severity_and_service() {
        // Arrange
        let manager = ErrorRecoveryManager::with_default_strategies(RecoverySettings::default());
        let validation = TestError {
            kind: "ValidationError",
            category: ErrorCategory::Validation,
            message: "START before HELLO".to_string(),
        };

        // Act
        manager.handle_error(&connection_error(), "connection_server", ErrorContext::default());
        manager.handle_error(&validation, "connection_server", ErrorContext::default());
        manager.handle_error(&validation, "time_sync", ErrorContext::default());
        let report = manager.get_error_report();

        // Assert
        assert_eq!(report.total_errors, 3);
        assert_eq!(report.by_severity.get(&Severity::High), Some(&1));
        assert_eq!(report.by_severity.get(&Severity::Low), Some(&2));
        assert_eq!(report.by_service.get("connection_server"), Some(&2));
        assert_eq!(report.by_service.get("time_sync"), Some(&1));
        assert_eq!(report.terminal, 0);
        assert!((report.recovery_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_default_validation_strategy_beats_connection_wording() {
        let manager = ErrorRecoveryManager::with_default_strategies(RecoverySettings::default());
        let err = TestError {
            kind: "ValidationError",
            category: ErrorCategory::Validation,
            message: "message on a connection that never sent HELLO".to_string(),
        };

        let outcome = manager.handle_error(&err, "connection_server", ErrorContext::default());

        assert_eq!(outcome.strategy.as_deref(), Some("validation"));
        assert_eq!(outcome.attempts, 0);
    }

    #[test]
    fn test_sweep_flags_noisy_services() {
        let manager = ErrorRecoveryManager::new(RecoverySettings {
            error_rate_threshold: 3,
            service_rate_threshold: 2,
            ..RecoverySettings::default()
        });
        for _ in 0..4 {
            manager.handle_error(&connection_error(), "busy", ErrorContext::default());
        }
        manager.handle_error(&connection_error(), "quiet", ErrorContext::default());

        let sweep = manager.sweep();

        assert_eq!(sweep.recent_errors, 5);
        assert!(sweep.high_error_rate);
        assert_eq!(sweep.noisy_services, vec!["busy".to_string()]);
    }

    #[test]
    fn test_sweep_prunes_errors_outside_window() {
        let manager = ErrorRecoveryManager::new(RecoverySettings {
            rate_window: Duration::ZERO,
            ..RecoverySettings::default()
        });
        manager.handle_error(&connection_error(), "svc", ErrorContext::default());
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(manager.sweep().recent_errors, 0);
        assert_eq!(manager.get_error_report().total_errors, 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_monitoring_loop() {
        let manager = Arc::new(ErrorRecoveryManager::new(RecoverySettings {
            monitor_interval: Duration::from_millis(10),
            ..RecoverySettings::default()
        }));

        manager.start().await;
        assert!(manager.is_running().await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.stop().await;

        assert!(!manager.is_running().await);
        // Errors are still handled with the loop stopped.
        let outcome = manager.handle_error(&connection_error(), "svc", ErrorContext::default());
        assert_eq!(outcome.resolution, Resolution::Unhandled);
    }

    #[test]
    fn test_retry_nobody_receives_is_not_counted_as_recovered() {
        // Arrange
        let manager = ErrorRecoveryManager::new(RecoverySettings::default());
        manager.add_recovery_strategy(
            "retry-only",
            RecoveryStrategy::new("ConnectionError", Severity::Medium, vec![RecoveryAction::Retry])
                .unwrap()
                .with_max_retries(2),
        );

        // Act
        let unheard = manager.handle_error(&connection_error(), "svc", ErrorContext::default());
        let mut rx = manager.register_error_callback("svc");
        let heard = manager.handle_error(&connection_error(), "svc", ErrorContext::default());
        let report = manager.get_error_report();

        // Assert
        assert_eq!(unheard.attempts, 2);
        assert_eq!(unheard.undelivered, 2);
        assert_eq!(unheard.resolution, Resolution::Unhandled);
        assert_eq!(heard.undelivered, 0);
        assert_eq!(heard.resolution, Resolution::Recovering);
        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(report.recovered, 1);
        assert_eq!(report.terminal, 1);
        assert_eq!(report.undelivered_actions, 2);
    }

    #[test]
    fn test_unheard_retry_still_falls_through_to_reconnect() {
        let manager = ErrorRecoveryManager::new(RecoverySettings::default());
        manager.add_recovery_strategy("conn", connection_strategy());

        let outcome = manager.handle_error(&connection_error(), "svc", ErrorContext::default());

        assert_eq!(outcome.undelivered, 3);
        assert_eq!(outcome.resolution, Resolution::Reconnect);
        assert!(outcome.should_disconnect());
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(RecoveryStrategy::new("(unclosed", Severity::Low, vec![]).is_err());
    }
}
