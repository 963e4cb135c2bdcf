// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Self-Healing: failure classification and automatic recovery.
//!
//! The [`SelfHealer`] receives failure reports from operational code,
//! classifies them by category, and drives a recovery strategy (retry with
//! exponential backoff, fallback to a substitute, or restore from a
//! checkpoint) under a concurrency bound. Exhausted recoveries are either
//! escalated to operators or surfaced back to the caller, per strategy.
//!
//! ## Flow
//!
//! 1. [`SelfHealer::detect_failure`] enqueues a [`FailureRecord`] and never blocks.
//! 2. The dispatcher (started with [`SelfHealer::start`]) pulls records
//!    FIFO, critical severity first, holding at most
//!    `max_concurrent_recoveries` recoveries in flight.
//! 3. [`SelfHealer::heal`] drives one record to a terminal state; the
//!    chaos-injection harness also calls it directly.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mendflow::healer::{FailureCategory, FailureSeverity, SelfHealer, SelfHealerConfig};
//!
//! let healer = Arc::new(SelfHealer::new(SelfHealerConfig::default()));
//! healer.register_action("payments-api", recovery_fn(|| async { reconnect().await }));
//! healer.start();
//!
//! let record = healer.detect_failure(
//!     FailureCategory::Network,
//!     "payments-api",
//!     "connection refused",
//!     FailureSeverity::High,
//! );
//! ```

use crate::circuit_breaker::CircuitBreakerManager;
use crate::constants::{
    BREAKER_DEFER_POLL, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_RETRY_DELAY,
    DEFAULT_MAX_CONCURRENT_RECOVERIES, DEFAULT_MAX_RETAINED_RECORDS, DEFAULT_MAX_RETRY_ATTEMPTS,
    DEFAULT_MAX_RETRY_DELAY, DEFAULT_RECOVERY_TIMEOUT,
};
use crate::error::{ResilienceError, Result};
use crate::events::{EventBus, ResilienceEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Category of a reported failure, used to select the recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureCategory {
    /// Connectivity-level failure (DNS, socket, partition).
    Network,
    /// A downstream service misbehaved (5xx, bad response, crash).
    Service,
    /// Persistence-layer failure.
    Database,
    /// Anything that could not be classified.
    Unknown,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Service => write!(f, "service"),
            Self::Database => write!(f, "database"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Severity of a reported failure. Critical failures jump the recovery queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureSeverity {
    /// Cosmetic or self-limiting.
    Low,
    /// Degrades a non-critical path.
    Medium,
    /// Degrades a critical path.
    High,
    /// The system cannot do its job until this is recovered.
    Critical,
}

impl std::fmt::Display for FailureSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Lifecycle status of a failure record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStatus {
    /// Waiting for a recovery slot.
    Queued,
    /// A recovery is in flight.
    Recovering,
    /// Recovery succeeded.
    Recovered,
    /// Recovery exhausted its strategy and the error was surfaced.
    Failed,
    /// Recovery exhausted its strategy and operators were alerted.
    Escalated,
}

impl FailureStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Recovered | Self::Failed | Self::Escalated)
    }
}

impl std::fmt::Display for FailureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Recovering => write!(f, "recovering"),
            Self::Recovered => write!(f, "recovered"),
            Self::Failed => write!(f, "failed"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

/// One reported failure, from detection through its terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Unique record id.
    pub id: Uuid,
    /// Category used for strategy selection.
    pub category: FailureCategory,
    /// Dependency or component the failure originated from. Doubles as the
    /// circuit-breaker key consulted before retries.
    pub source_id: String,
    /// Rendered cause of the failure.
    pub error: String,
    /// Reported severity.
    pub severity: FailureSeverity,
    /// When the failure was reported.
    pub detected_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: FailureStatus,
}

/// What to do when a recovery strategy is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnExhausted {
    /// Raise a human-facing alert and mark the record escalated.
    Escalate,
    /// Mark the record failed and surface the error to the caller.
    Fail,
}

/// Backoff schedule for the retry strategy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before the strategy is exhausted (default: 3).
    pub max_attempts: u32,
    /// Delay before the second attempt (default: 1s).
    pub initial_delay: Duration,
    /// Cap on the exponential delay (default: 30s).
    pub max_delay: Duration,
    /// Multiplier applied per attempt (default: 2.0).
    pub backoff_multiplier: f64,
    /// Random variation applied to each delay, 0.0 to 1.0 (default: 0.0).
    /// Raise this when many recoveries target the same dependency to avoid
    /// synchronized retry waves.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_RETRY_DELAY,
            max_delay: DEFAULT_MAX_RETRY_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the delay before the second attempt.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the cap on the exponential delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the jitter factor (clamped to 0.0..=1.0).
    #[must_use]
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay to sleep after the `n`th failed attempt (0-based):
    /// `min(initial_delay * backoff_multiplier^n, max_delay)`, jittered.
    #[must_use]
    pub fn delay_for(&self, n: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(n.min(20) as i32);
        let secs = self.initial_delay.as_secs_f64() * exp;
        let capped = secs.min(self.max_delay.as_secs_f64());
        let base = if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        };
        self.apply_jitter(base)
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.jitter_factor <= 0.0 || duration.is_zero() {
            return duration;
        }
        let factor = 1.0
            + rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        let jittered = (duration.as_secs_f64() * factor).max(0.0);
        Duration::from_secs_f64(jittered)
    }
}

/// The unit of work re-run by the retry strategy. Registered per source id
/// with [`SelfHealer::register_action`].
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    /// Re-run the failed operation once.
    async fn execute(&self) -> std::result::Result<(), String>;
}

/// Substitute producer invoked by the fallback strategy.
#[async_trait]
pub trait FallbackProducer: Send + Sync {
    /// Produce the substitute result for the failed source.
    async fn produce(&self, record: &FailureRecord) -> std::result::Result<(), String>;
}

/// Last-known-good checkpoint used by the restore strategy.
#[async_trait]
pub trait CheckpointSource: Send + Sync {
    /// Roll back to the last-known-good checkpoint.
    async fn restore(&self) -> std::result::Result<(), String>;
    /// Verify the system is healthy after the rollback. Restore only counts
    /// as recovered once this passes.
    async fn verify(&self) -> std::result::Result<(), String>;
}

/// Receives human-facing alerts for escalated recoveries.
pub trait AlertHandler: Send + Sync {
    /// Called once per escalated record.
    fn on_escalation(&self, record: &FailureRecord);
}

struct FnRecoveryAction<F>(F);

#[async_trait]
impl<F, Fut> RecoveryAction for FnRecoveryAction<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), String>> + Send,
{
    async fn execute(&self) -> std::result::Result<(), String> {
        (self.0)().await
    }
}

/// Wraps an async closure as a [`RecoveryAction`].
pub fn recovery_fn<F, Fut>(f: F) -> Arc<dyn RecoveryAction>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    Arc::new(FnRecoveryAction(f))
}

/// How to recover a failure of a given category.
///
/// Modeled as a closed sum so the selection `match` is exhaustive: adding a
/// strategy kind forces every selection site to handle it.
#[derive(Clone)]
pub enum RecoveryStrategy {
    /// Re-run the registered [`RecoveryAction`] with exponential backoff.
    Retry {
        /// Backoff schedule.
        policy: RetryPolicy,
        /// Applied when all attempts fail.
        on_exhausted: OnExhausted,
    },
    /// Invoke a pre-registered substitute producer immediately, no retries.
    Fallback {
        /// The substitute producer.
        producer: Arc<dyn FallbackProducer>,
        /// Applied when the producer fails.
        on_exhausted: OnExhausted,
    },
    /// Roll back to a checkpoint; recovered only after verification passes.
    Restore {
        /// The checkpoint source.
        source: Arc<dyn CheckpointSource>,
        /// Applied when restore or verification fails.
        on_exhausted: OnExhausted,
    },
}

impl std::fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry {
                policy,
                on_exhausted,
            } => f
                .debug_struct("Retry")
                .field("policy", policy)
                .field("on_exhausted", on_exhausted)
                .finish(),
            Self::Fallback { on_exhausted, .. } => f
                .debug_struct("Fallback")
                .field("on_exhausted", on_exhausted)
                .finish_non_exhaustive(),
            Self::Restore { on_exhausted, .. } => f
                .debug_struct("Restore")
                .field("on_exhausted", on_exhausted)
                .finish_non_exhaustive(),
        }
    }
}

/// Outcome of driving one record through its strategy.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    /// Whether the record recovered.
    pub success: bool,
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
    /// Total time spent on the recovery in milliseconds.
    pub total_duration_ms: u64,
    /// Last error observed, when the recovery did not succeed.
    pub error: Option<String>,
}

enum AttemptOutcome {
    Recovered { attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
}

/// Per-category recovery counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryStats {
    /// Failures detected in this category.
    pub detected: u64,
    /// Recoveries that succeeded.
    pub recovered: u64,
    /// Recoveries that failed.
    pub failed: u64,
    /// Recoveries that escalated.
    pub escalated: u64,
}

impl CategoryStats {
    /// Fraction of terminal recoveries that succeeded (1.0 when none yet).
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let terminal = self.recovered + self.failed + self.escalated;
        if terminal == 0 {
            1.0
        } else {
            self.recovered as f64 / terminal as f64
        }
    }
}

/// Snapshot of healer statistics.
#[derive(Debug, Clone)]
pub struct HealerStats {
    /// Total failures detected.
    pub total_detected: u64,
    /// Recoveries that reached the recovered state.
    pub total_recovered: u64,
    /// Recoveries that reached the failed state.
    pub total_failed: u64,
    /// Recoveries that escalated.
    pub total_escalated: u64,
    /// Counters split by failure category.
    pub by_category: HashMap<FailureCategory, CategoryStats>,
}

impl HealerStats {
    /// Recoveries that reached any terminal state.
    #[must_use]
    pub fn terminal_total(&self) -> u64 {
        self.total_recovered + self.total_failed + self.total_escalated
    }

    /// Fraction of terminal recoveries that succeeded (1.0 when none yet).
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let terminal = self.terminal_total();
        if terminal == 0 {
            1.0
        } else {
            self.total_recovered as f64 / terminal as f64
        }
    }
}

/// Configuration for the self-healer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SelfHealerConfig {
    /// Recoveries allowed in flight at once (default: 5).
    pub max_concurrent_recoveries: usize,
    /// Wall-clock bound on a single recovery attempt (default: 30s).
    pub recovery_timeout: Duration,
    /// Terminal records retained for statistics before rotation (default: 1000).
    pub max_retained_records: usize,
}

impl Default for SelfHealerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_recoveries: DEFAULT_MAX_CONCURRENT_RECOVERIES,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            max_retained_records: DEFAULT_MAX_RETAINED_RECORDS,
        }
    }
}

impl SelfHealerConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the recovery concurrency bound.
    #[must_use]
    pub fn with_max_concurrent_recoveries(mut self, max: usize) -> Self {
        self.max_concurrent_recoveries = max.max(1);
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Sets the terminal-record retention cap.
    #[must_use]
    pub fn with_max_retained_records(mut self, max: usize) -> Self {
        self.max_retained_records = max.max(1);
        self
    }
}

#[derive(Debug, Default)]
struct RecoveryQueue {
    critical: VecDeque<Uuid>,
    normal: VecDeque<Uuid>,
}

#[derive(Debug, Default)]
struct Counters {
    detected: AtomicU64,
    recovered: AtomicU64,
    failed: AtomicU64,
    escalated: AtomicU64,
}

/// Receives failure reports and drives them to a terminal state.
///
/// See the [module docs](self) for the overall flow.
pub struct SelfHealer {
    config: SelfHealerConfig,
    strategies: HashMap<FailureCategory, RecoveryStrategy>,
    default_strategy: RecoveryStrategy,
    records: DashMap<Uuid, FailureRecord>,
    terminal_ids: Mutex<VecDeque<Uuid>>,
    queue: Mutex<RecoveryQueue>,
    queue_notify: Notify,
    semaphore: Arc<Semaphore>,
    actions: RwLock<HashMap<String, Arc<dyn RecoveryAction>>>,
    alert_handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    events: Option<EventBus>,
    counters: Counters,
    by_category: Mutex<HashMap<FailureCategory, CategoryStats>>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SelfHealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfHealer")
            .field("config", &self.config)
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl SelfHealer {
    /// Creates a new self-healer with the given configuration.
    #[must_use]
    pub fn new(config: SelfHealerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_recoveries));
        Self {
            config,
            strategies: HashMap::new(),
            default_strategy: RecoveryStrategy::Retry {
                policy: RetryPolicy::default(),
                on_exhausted: OnExhausted::Escalate,
            },
            records: DashMap::new(),
            terminal_ids: Mutex::new(VecDeque::new()),
            queue: Mutex::new(RecoveryQueue::default()),
            queue_notify: Notify::new(),
            semaphore,
            actions: RwLock::new(HashMap::new()),
            alert_handlers: RwLock::new(Vec::new()),
            breakers: None,
            events: None,
            counters: Counters::default(),
            by_category: Mutex::new(HashMap::new()),
            shutdown_tx,
            dispatcher: Mutex::new(None),
        }
    }

    /// Attaches an event bus; failure and recovery events are published to it.
    #[must_use]
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Attaches the breaker manager consulted before retry attempts.
    #[must_use]
    pub fn with_breaker_manager(mut self, breakers: Arc<CircuitBreakerManager>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Sets the recovery strategy for one failure category.
    #[must_use]
    pub fn with_strategy(mut self, category: FailureCategory, strategy: RecoveryStrategy) -> Self {
        self.strategies.insert(category, strategy);
        self
    }

    /// Sets the strategy used for categories without an explicit one.
    #[must_use]
    pub fn with_default_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Registers the unit of work re-run when retrying failures from `source_id`.
    pub fn register_action(&self, source_id: impl Into<String>, action: Arc<dyn RecoveryAction>) {
        self.actions.write().insert(source_id.into(), action);
    }

    /// Registers a handler notified on every escalation.
    pub fn add_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.alert_handlers.write().push(handler);
    }

    /// Reports a failure and enqueues it for recovery. Never blocks.
    pub fn detect_failure(
        &self,
        category: FailureCategory,
        source_id: impl Into<String>,
        error: impl Into<String>,
        severity: FailureSeverity,
    ) -> FailureRecord {
        let record = FailureRecord {
            id: Uuid::new_v4(),
            category,
            source_id: source_id.into(),
            error: error.into(),
            severity,
            detected_at: Utc::now(),
            status: FailureStatus::Queued,
        };
        self.records.insert(record.id, record.clone());

        {
            let mut queue = self.queue.lock();
            if severity == FailureSeverity::Critical {
                queue.critical.push_back(record.id);
            } else {
                queue.normal.push_back(record.id);
            }
        }

        self.counters.detected.fetch_add(1, Ordering::Relaxed);
        self.by_category.lock().entry(category).or_default().detected += 1;

        tracing::info!(
            record = %record.id,
            source = %record.source_id,
            category = %category,
            severity = %severity,
            "failure detected"
        );
        self.publish(ResilienceEvent::FailureDetected {
            id: record.id,
            category,
            source_id: record.source_id.clone(),
            severity,
            timestamp: record.detected_at,
        });

        self.queue_notify.notify_one();
        record
    }

    /// Starts the recovery dispatcher. Restarting after a shutdown resumes
    /// servicing whatever stayed queued.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.dispatcher.lock();
        if guard.is_some() {
            return;
        }
        self.shutdown_tx.send_replace(false);
        let healer = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *guard = Some(tokio::spawn(healer.dispatch_loop(shutdown_rx)));
    }

    /// Stops the dispatcher and waits for in-flight recoveries to finish or
    /// time out. Queued records stay queued and are serviced on restart.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // Draining every permit waits out the in-flight recoveries.
        let max = self.config.max_concurrent_recoveries as u32;
        if let Ok(permits) = self.semaphore.acquire_many(max).await {
            drop(permits);
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            // Slot first, so a freed slot always serves the highest-priority
            // queued record rather than whichever task raced first.
            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    }
                }
                _ = shutdown.changed() => return,
            };
            if *shutdown.borrow() {
                return;
            }

            let id = loop {
                if let Some(id) = self.pop_next() {
                    break id;
                }
                tokio::select! {
                    _ = self.queue_notify.notified() => {}
                    _ = shutdown.changed() => return,
                }
            };

            let healer = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = healer.heal(id).await {
                    // Raced with a direct heal() call; nothing to do.
                    tracing::debug!(record = %id, error = %e, "dispatch skipped record");
                }
            });
        }
    }

    fn pop_next(&self) -> Option<Uuid> {
        let mut queue = self.queue.lock();
        queue.critical.pop_front().or_else(|| queue.normal.pop_front())
    }

    /// Drives one queued record to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::RecordNotFound`] for an unknown id and
    /// [`ResilienceError::RecordNotQueued`] if the record is already being
    /// recovered or finished.
    pub async fn heal(&self, id: Uuid) -> Result<RecoveryResult> {
        let start = Instant::now();
        let record = {
            let mut entry = self
                .records
                .get_mut(&id)
                .ok_or(ResilienceError::RecordNotFound(id))?;
            if entry.status != FailureStatus::Queued {
                return Err(ResilienceError::RecordNotQueued {
                    id,
                    status: entry.status,
                });
            }
            entry.status = FailureStatus::Recovering;
            entry.clone()
        };

        tracing::info!(
            record = %id,
            source = %record.source_id,
            category = %record.category,
            "recovery started"
        );

        let (outcome, on_exhausted) = match self.strategy_for(record.category) {
            RecoveryStrategy::Retry {
                policy,
                on_exhausted,
            } => (self.run_retry(&record, &policy).await, on_exhausted),
            RecoveryStrategy::Fallback {
                producer,
                on_exhausted,
            } => (
                self.run_fallback(&record, producer.as_ref()).await,
                on_exhausted,
            ),
            RecoveryStrategy::Restore {
                source,
                on_exhausted,
            } => (
                self.run_restore(&record, source.as_ref()).await,
                on_exhausted,
            ),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            AttemptOutcome::Recovered { attempts } => {
                self.finish(&record, FailureStatus::Recovered, attempts, duration_ms, None);
                Ok(RecoveryResult {
                    success: true,
                    attempts,
                    total_duration_ms: duration_ms,
                    error: None,
                })
            }
            AttemptOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                let status = match on_exhausted {
                    OnExhausted::Escalate => FailureStatus::Escalated,
                    OnExhausted::Fail => FailureStatus::Failed,
                };
                self.finish(&record, status, attempts, duration_ms, Some(&last_error));
                Ok(RecoveryResult {
                    success: false,
                    attempts,
                    total_duration_ms: duration_ms,
                    error: Some(last_error),
                })
            }
        }
    }

    fn strategy_for(&self, category: FailureCategory) -> RecoveryStrategy {
        self.strategies
            .get(&category)
            .unwrap_or(&self.default_strategy)
            .clone()
    }

    async fn run_retry(&self, record: &FailureRecord, policy: &RetryPolicy) -> AttemptOutcome {
        let mut last_error = record.error.clone();
        for attempt in 0..policy.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(policy.delay_for(attempt - 1)).await;
            }
            self.defer_while_breaker_open(&record.source_id).await;

            let action = self.actions.read().get(&record.source_id).map(Arc::clone);
            let result = match action {
                None => Err(format!(
                    "no recovery action registered for source '{}'",
                    record.source_id
                )),
                Some(action) => self.bounded_attempt(action.execute()).await,
            };

            match result {
                Ok(()) => {
                    return AttemptOutcome::Recovered {
                        attempts: attempt + 1,
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        record = %record.id,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "recovery attempt failed"
                    );
                    last_error = e;
                }
            }
        }
        AttemptOutcome::Exhausted {
            attempts: policy.max_attempts,
            last_error,
        }
    }

    async fn run_fallback(
        &self,
        record: &FailureRecord,
        producer: &dyn FallbackProducer,
    ) -> AttemptOutcome {
        match self.bounded_attempt(producer.produce(record)).await {
            Ok(()) => AttemptOutcome::Recovered { attempts: 1 },
            Err(e) => AttemptOutcome::Exhausted {
                attempts: 1,
                last_error: e,
            },
        }
    }

    async fn run_restore(
        &self,
        record: &FailureRecord,
        source: &dyn CheckpointSource,
    ) -> AttemptOutcome {
        if let Err(e) = self.bounded_attempt(source.restore()).await {
            return AttemptOutcome::Exhausted {
                attempts: 1,
                last_error: format!("restore failed: {e}"),
            };
        }
        // Recovered only once post-restore verification passes.
        match self.bounded_attempt(source.verify()).await {
            Ok(()) => AttemptOutcome::Recovered { attempts: 1 },
            Err(e) => AttemptOutcome::Exhausted {
                attempts: 1,
                last_error: format!("post-restore verification failed: {e}"),
            },
        }
    }

    /// Bounds one attempt by `recovery_timeout`; elapsing counts as failure.
    async fn bounded_attempt<F>(&self, attempt: F) -> std::result::Result<(), String>
    where
        F: Future<Output = std::result::Result<(), String>>,
    {
        match tokio::time::timeout(self.config.recovery_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "recovery attempt timed out after {:?}",
                self.config.recovery_timeout
            )),
        }
    }

    /// Waits for the source's breaker to leave the open state rather than
    /// burning an attempt against a dependency known to be down.
    async fn defer_while_breaker_open(&self, source_id: &str) {
        let Some(manager) = &self.breakers else { return };
        let Some(breaker) = manager.get(source_id) else {
            return;
        };
        let mut deferred = false;
        while let Some(remaining) = breaker.remaining_open_time() {
            if !deferred {
                tracing::debug!(source = source_id, "deferring recovery while breaker open");
                deferred = true;
            }
            let wait = remaining
                .min(BREAKER_DEFER_POLL)
                .max(Duration::from_millis(1));
            tokio::time::sleep(wait).await;
        }
    }

    fn finish(
        &self,
        record: &FailureRecord,
        status: FailureStatus,
        attempts: u32,
        duration_ms: u64,
        last_error: Option<&str>,
    ) {
        let snapshot = {
            match self.records.get_mut(&record.id) {
                Some(mut entry) => {
                    entry.status = status;
                    entry.clone()
                }
                None => {
                    let mut snapshot = record.clone();
                    snapshot.status = status;
                    snapshot
                }
            }
        };

        {
            let mut by_category = self.by_category.lock();
            let stats = by_category.entry(record.category).or_default();
            match status {
                FailureStatus::Recovered => stats.recovered += 1,
                FailureStatus::Failed => stats.failed += 1,
                FailureStatus::Escalated => stats.escalated += 1,
                FailureStatus::Queued | FailureStatus::Recovering => {}
            }
        }

        match status {
            FailureStatus::Recovered => {
                self.counters.recovered.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    record = %record.id,
                    source = %record.source_id,
                    attempts,
                    duration_ms,
                    "recovery succeeded"
                );
                self.publish(ResilienceEvent::RecoverySucceeded {
                    id: record.id,
                    source_id: record.source_id.clone(),
                    attempts,
                    duration_ms,
                    timestamp: Utc::now(),
                });
            }
            FailureStatus::Failed => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let error = last_error.unwrap_or(&record.error).to_string();
                tracing::warn!(
                    record = %record.id,
                    source = %record.source_id,
                    attempts,
                    error = %error,
                    "recovery failed"
                );
                self.publish(ResilienceEvent::RecoveryFailed {
                    id: record.id,
                    source_id: record.source_id.clone(),
                    attempts,
                    error,
                    timestamp: Utc::now(),
                });
            }
            FailureStatus::Escalated => {
                self.counters.escalated.fetch_add(1, Ordering::Relaxed);
                let error = last_error.unwrap_or(&record.error).to_string();
                tracing::error!(
                    record = %record.id,
                    source = %record.source_id,
                    attempts,
                    error = %error,
                    "recovery exhausted, escalating to operators"
                );
                let handlers: Vec<_> = self.alert_handlers.read().iter().map(Arc::clone).collect();
                for handler in handlers {
                    handler.on_escalation(&snapshot);
                }
                self.publish(ResilienceEvent::EscalationTriggered {
                    id: record.id,
                    source_id: record.source_id.clone(),
                    error,
                    timestamp: Utc::now(),
                });
            }
            FailureStatus::Queued | FailureStatus::Recovering => {}
        }

        self.retain_terminal(record.id);
    }

    /// Rotates terminal records past the retention cap, oldest first.
    fn retain_terminal(&self, id: Uuid) {
        let mut terminal = self.terminal_ids.lock();
        terminal.push_back(id);
        while terminal.len() > self.config.max_retained_records {
            if let Some(old) = terminal.pop_front() {
                self.records.remove(&old);
            }
        }
    }

    fn publish(&self, event: ResilienceEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    /// Returns a failure record by id.
    #[must_use]
    pub fn record(&self, id: Uuid) -> Option<FailureRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    /// Counts records by lifecycle status.
    #[must_use]
    pub fn status_counts(&self) -> HashMap<FailureStatus, usize> {
        let mut counts = HashMap::new();
        for entry in &self.records {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }

    /// Number of records waiting for a recovery slot.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        let queue = self.queue.lock();
        queue.critical.len() + queue.normal.len()
    }

    /// Snapshot of healer statistics.
    #[must_use]
    pub fn stats(&self) -> HealerStats {
        HealerStats {
            total_detected: self.counters.detected.load(Ordering::Relaxed),
            total_recovered: self.counters.recovered.load(Ordering::Relaxed),
            total_failed: self.counters.failed.load(Ordering::Relaxed),
            total_escalated: self.counters.escalated.load(Ordering::Relaxed),
            by_category: self.by_category.lock().clone(),
        }
    }

    /// Overall recovery success rate, 0.0 to 1.0 (1.0 when nothing terminal yet).
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        self.stats().success_rate()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> SelfHealerConfig {
        SelfHealerConfig::new()
            .with_max_concurrent_recoveries(3)
            .with_recovery_timeout(Duration::from_millis(200))
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(max_attempts)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(40))
    }

    struct CountingAction {
        calls: AtomicU32,
        succeed_after: u32,
    }

    #[async_trait]
    impl RecoveryAction for CountingAction {
        async fn execute(&self) -> std::result::Result<(), String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_after {
                Ok(())
            } else {
                Err(format!("still failing (call {call})"))
            }
        }
    }

    struct CollectingAlerts(Mutex<Vec<Uuid>>);

    impl AlertHandler for CollectingAlerts {
        fn on_escalation(&self, record: &FailureRecord) {
            self.0.lock().push(record.id);
        }
    }

    #[test]
    fn test_detect_failure_enqueues_record() {
        let healer = SelfHealer::new(fast_config());
        let record = healer.detect_failure(
            FailureCategory::Network,
            "payments-api",
            "connection refused",
            FailureSeverity::High,
        );

        assert_eq!(record.status, FailureStatus::Queued);
        assert_eq!(healer.queued_len(), 1);
        assert_eq!(healer.stats().total_detected, 1);
        assert_eq!(
            healer.record(record.id).unwrap().status,
            FailureStatus::Queued
        );
    }

    #[test]
    fn test_critical_failures_jump_the_queue() {
        let healer = SelfHealer::new(fast_config());
        let low = healer.detect_failure(
            FailureCategory::Service,
            "svc",
            "slow",
            FailureSeverity::Low,
        );
        let critical = healer.detect_failure(
            FailureCategory::Database,
            "db",
            "down",
            FailureSeverity::Critical,
        );

        assert_eq!(healer.pop_next(), Some(critical.id));
        assert_eq!(healer.pop_next(), Some(low.id));
        assert_eq!(healer.pop_next(), None);
    }

    #[tokio::test]
    async fn test_retry_recovers_on_later_attempt() {
        let healer = SelfHealer::new(fast_config()).with_strategy(
            FailureCategory::Network,
            RecoveryStrategy::Retry {
                policy: fast_retry(3),
                on_exhausted: OnExhausted::Fail,
            },
        );
        healer.register_action(
            "api",
            Arc::new(CountingAction {
                calls: AtomicU32::new(0),
                succeed_after: 2,
            }),
        );

        let record = healer.detect_failure(
            FailureCategory::Network,
            "api",
            "timeout",
            FailureSeverity::Medium,
        );
        let result = healer.heal(record.id).await.unwrap();

        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert_eq!(
            healer.record(record.id).unwrap().status,
            FailureStatus::Recovered
        );
        assert_eq!(healer.stats().total_recovered, 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fail_surfaces_error() {
        let healer = SelfHealer::new(fast_config()).with_strategy(
            FailureCategory::Network,
            RecoveryStrategy::Retry {
                policy: fast_retry(3),
                on_exhausted: OnExhausted::Fail,
            },
        );
        healer.register_action(
            "api",
            Arc::new(CountingAction {
                calls: AtomicU32::new(0),
                succeed_after: u32::MAX,
            }),
        );

        let record = healer.detect_failure(
            FailureCategory::Network,
            "api",
            "timeout",
            FailureSeverity::Medium,
        );
        let result = healer.heal(record.id).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert!(result.error.unwrap().contains("still failing"));
        assert_eq!(
            healer.record(record.id).unwrap().status,
            FailureStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_retry_exhaustion_escalates_and_alerts() {
        let alerts = Arc::new(CollectingAlerts(Mutex::new(Vec::new())));
        let healer = SelfHealer::new(fast_config()).with_default_strategy(
            RecoveryStrategy::Retry {
                policy: fast_retry(2),
                on_exhausted: OnExhausted::Escalate,
            },
        );
        healer.add_alert_handler(Arc::clone(&alerts) as Arc<dyn AlertHandler>);

        // No action registered: every attempt fails immediately.
        let record = healer.detect_failure(
            FailureCategory::Unknown,
            "mystery",
            "???",
            FailureSeverity::High,
        );
        let result = healer.heal(record.id).await.unwrap();

        assert!(!result.success);
        assert_eq!(
            healer.record(record.id).unwrap().status,
            FailureStatus::Escalated
        );
        assert_eq!(healer.stats().total_escalated, 1);
        assert_eq!(alerts.0.lock().as_slice(), &[record.id]);
    }

    #[tokio::test]
    async fn test_exponential_backoff_schedule() {
        let healer = SelfHealer::new(fast_config()).with_strategy(
            FailureCategory::Network,
            RecoveryStrategy::Retry {
                policy: RetryPolicy::new()
                    .with_max_attempts(3)
                    .with_initial_delay(Duration::from_millis(50))
                    .with_backoff_multiplier(2.0)
                    .with_max_delay(Duration::from_secs(1)),
                on_exhausted: OnExhausted::Fail,
            },
        );
        let action = Arc::new(CountingAction {
            calls: AtomicU32::new(0),
            succeed_after: u32::MAX,
        });
        healer.register_action("api", Arc::clone(&action) as Arc<dyn RecoveryAction>);

        let record = healer.detect_failure(
            FailureCategory::Network,
            "api",
            "timeout",
            FailureSeverity::Medium,
        );
        let start = Instant::now();
        let result = healer.heal(record.id).await.unwrap();
        let elapsed = start.elapsed();

        // Attempts at ~0ms, ~50ms, ~150ms; exhaustion applied exactly once.
        assert_eq!(result.attempts, 3);
        assert_eq!(action.calls.load(Ordering::SeqCst), 3);
        assert!(elapsed >= Duration::from_millis(150), "elapsed {elapsed:?}");
        assert_eq!(healer.stats().total_failed, 1);
    }

    struct CountingFallback(AtomicU32, bool);

    #[async_trait]
    impl FallbackProducer for CountingFallback {
        async fn produce(&self, _record: &FailureRecord) -> std::result::Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if self.1 {
                Ok(())
            } else {
                Err("fallback unavailable".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_fallback_invoked_once_no_retries() {
        let producer = Arc::new(CountingFallback(AtomicU32::new(0), true));
        let healer = SelfHealer::new(fast_config()).with_strategy(
            FailureCategory::Service,
            RecoveryStrategy::Fallback {
                producer: Arc::clone(&producer) as Arc<dyn FallbackProducer>,
                on_exhausted: OnExhausted::Fail,
            },
        );

        let record = healer.detect_failure(
            FailureCategory::Service,
            "recommendations",
            "500",
            FailureSeverity::Low,
        );
        let result = healer.heal(record.id).await.unwrap();

        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(producer.0.load(Ordering::SeqCst), 1);
    }

    struct StubCheckpoint {
        restore_ok: bool,
        verify_ok: bool,
    }

    #[async_trait]
    impl CheckpointSource for StubCheckpoint {
        async fn restore(&self) -> std::result::Result<(), String> {
            if self.restore_ok {
                Ok(())
            } else {
                Err("no checkpoint".to_string())
            }
        }
        async fn verify(&self) -> std::result::Result<(), String> {
            if self.verify_ok {
                Ok(())
            } else {
                Err("state mismatch".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_restore_requires_verification() {
        let healer = SelfHealer::new(fast_config()).with_strategy(
            FailureCategory::Database,
            RecoveryStrategy::Restore {
                source: Arc::new(StubCheckpoint {
                    restore_ok: true,
                    verify_ok: false,
                }),
                on_exhausted: OnExhausted::Fail,
            },
        );

        let record = healer.detect_failure(
            FailureCategory::Database,
            "primary-db",
            "corruption",
            FailureSeverity::Critical,
        );
        let result = healer.heal(record.id).await.unwrap();

        assert!(!result.success);
        assert!(result.error.unwrap().contains("verification"));
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let healer = SelfHealer::new(
            fast_config().with_recovery_timeout(Duration::from_millis(30)),
        )
        .with_strategy(
            FailureCategory::Network,
            RecoveryStrategy::Retry {
                policy: fast_retry(1),
                on_exhausted: OnExhausted::Fail,
            },
        );
        healer.register_action(
            "api",
            recovery_fn(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            }),
        );

        let record = healer.detect_failure(
            FailureCategory::Network,
            "api",
            "timeout",
            FailureSeverity::Medium,
        );
        let result = healer.heal(record.id).await.unwrap();

        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_retry_defers_while_breaker_open() {
        let breakers = Arc::new(
            CircuitBreakerManager::new().with_default_config(
                CircuitBreakerConfig::new()
                    .with_failure_threshold(1)
                    .with_timeout(Duration::from_millis(80)),
            ),
        );
        let breaker = breakers.get_or_create("api");
        breaker.record_failure(Some("down"));
        assert!(breaker.remaining_open_time().is_some());

        let healer = SelfHealer::new(fast_config())
            .with_breaker_manager(Arc::clone(&breakers))
            .with_strategy(
                FailureCategory::Network,
                RecoveryStrategy::Retry {
                    policy: fast_retry(1),
                    on_exhausted: OnExhausted::Fail,
                },
            );
        healer.register_action("api", recovery_fn(|| async { Ok(()) }));

        let record = healer.detect_failure(
            FailureCategory::Network,
            "api",
            "down",
            FailureSeverity::High,
        );
        let start = Instant::now();
        let result = healer.heal(record.id).await.unwrap();

        // The single attempt waited for the breaker instead of burning itself.
        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_dispatcher_respects_concurrency_bound() {
        let healer = Arc::new(
            SelfHealer::new(
                SelfHealerConfig::new()
                    .with_max_concurrent_recoveries(2)
                    .with_recovery_timeout(Duration::from_millis(500)),
            )
            .with_default_strategy(RecoveryStrategy::Retry {
                policy: fast_retry(1),
                on_exhausted: OnExhausted::Fail,
            }),
        );

        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            healer.register_action(
                "svc",
                recovery_fn(move || {
                    let in_flight = Arc::clone(&in_flight);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );
        }

        healer.start();
        for _ in 0..8 {
            healer.detect_failure(
                FailureCategory::Service,
                "svc",
                "blip",
                FailureSeverity::Medium,
            );
        }

        // All eight must eventually reach a terminal state.
        for _ in 0..100 {
            if healer.stats().terminal_total() == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let stats = healer.stats();
        assert_eq!(stats.total_recovered, 8);
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {peak:?}");

        healer.shutdown().await;
    }

    #[tokio::test]
    async fn test_heal_unknown_record() {
        let healer = SelfHealer::new(fast_config());
        let err = healer.heal(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_heal_is_single_shot_per_record() {
        let healer = SelfHealer::new(fast_config()).with_default_strategy(
            RecoveryStrategy::Retry {
                policy: fast_retry(1),
                on_exhausted: OnExhausted::Fail,
            },
        );
        healer.register_action("svc", recovery_fn(|| async { Ok(()) }));

        let record = healer.detect_failure(
            FailureCategory::Service,
            "svc",
            "blip",
            FailureSeverity::Low,
        );
        assert!(healer.heal(record.id).await.unwrap().success);

        let err = healer.heal(record.id).await.unwrap_err();
        assert!(matches!(err, ResilienceError::RecordNotQueued { .. }));
    }

    #[tokio::test]
    async fn test_terminal_record_retention() {
        let healer = SelfHealer::new(
            fast_config().with_max_retained_records(2),
        )
        .with_default_strategy(RecoveryStrategy::Retry {
            policy: fast_retry(1),
            on_exhausted: OnExhausted::Fail,
        });
        healer.register_action("svc", recovery_fn(|| async { Ok(()) }));

        let mut ids = Vec::new();
        for _ in 0..4 {
            let record = healer.detect_failure(
                FailureCategory::Service,
                "svc",
                "blip",
                FailureSeverity::Low,
            );
            healer.heal(record.id).await.unwrap();
            ids.push(record.id);
        }

        assert!(healer.record(ids[0]).is_none());
        assert!(healer.record(ids[1]).is_none());
        assert!(healer.record(ids[3]).is_some());
        // Statistics survive rotation.
        assert_eq!(healer.stats().total_recovered, 4);
    }

    #[test]
    fn test_retry_policy_delay_caps_at_max() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(10.0)
            .with_max_delay(Duration::from_millis(300));

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for(10), Duration::from_millis(300));
    }

    #[test]
    fn test_category_success_rate() {
        let stats = CategoryStats {
            detected: 4,
            recovered: 3,
            failed: 1,
            escalated: 0,
        };
        assert!((stats.success_rate() - 0.75).abs() < f64::EPSILON);
        assert!((CategoryStats::default().success_rate() - 1.0).abs() < f64::EPSILON);
    }
}
