// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Health Monitoring for the resilience core.
//!
//! The [`HealthMonitor`] polls registered health-check callbacks on a fixed
//! interval, combines their sub-scores into one 0-100 system score, and
//! publishes each [`HealthSample`] to subscribers (notably the
//! graceful-degradation engine). A check marked critical vetoes the whole
//! score to 0 when it fails.
//!
//! The monitor only observes and notifies; it never mutates degradation
//! state itself.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mendflow::health::{HealthMonitor, HealthMonitorConfig};
//!
//! let monitor = Arc::new(HealthMonitor::new(HealthMonitorConfig::default()));
//! monitor.register_check("queue-depth", false, move || {
//!     Ok(score_from_depth(queue.len()))
//! });
//! monitor.attach_breaker_manager(&breakers);
//! monitor.start();
//!
//! let health = monitor.system_health();
//! println!("{} ({})", health.score, health.status);
//! ```

use crate::circuit_breaker::CircuitBreakerManager;
use crate::constants::{
    DEFAULT_CHECK_INTERVAL, DEFAULT_EMERGENCY_THRESHOLD, DEFAULT_MINIMAL_THRESHOLD,
    DEFAULT_REDUCED_THRESHOLD, HEALTH_HISTORY_CAP,
};
use crate::degradation::DegradationLevel;
use crate::healer::SelfHealer;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Coarse health classification derived from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Score above the reduced threshold.
    Healthy,
    /// Score at or below the reduced threshold but above emergency.
    Degraded,
    /// Score at or below the emergency threshold.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One computed health sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    /// Combined 0-100 score.
    pub score: f64,
    /// When the sample was computed.
    pub computed_at: DateTime<Utc>,
    /// Sub-score per registered check.
    pub signals: HashMap<String, f64>,
}

/// Synchronous view of the latest system health.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SystemHealth {
    /// Latest combined score.
    pub score: f64,
    /// Classification of the score.
    pub status: HealthStatus,
}

/// Direction the score has been moving over the rolling history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthTrend {
    /// Recent samples score meaningfully higher than older ones.
    Improving,
    /// No meaningful movement.
    Stable,
    /// Recent samples score meaningfully lower than older ones.
    Degrading,
}

/// Score ranges mapped to degradation levels.
///
/// Scores are compared inclusively: a score equal to a threshold belongs to
/// the degraded side, so recovery requires strictly exceeding it.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    /// At or below this score the system runs REDUCED (default: 80).
    pub reduced: f64,
    /// At or below this score the system runs MINIMAL (default: 60).
    pub minimal: f64,
    /// At or below this score the system runs EMERGENCY (default: 40).
    pub emergency: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            reduced: DEFAULT_REDUCED_THRESHOLD,
            minimal: DEFAULT_MINIMAL_THRESHOLD,
            emergency: DEFAULT_EMERGENCY_THRESHOLD,
        }
    }
}

impl HealthThresholds {
    /// Degradation level a score maps to.
    #[must_use]
    pub fn target_level(&self, score: f64) -> DegradationLevel {
        if score <= self.emergency {
            DegradationLevel::Emergency
        } else if score <= self.minimal {
            DegradationLevel::Minimal
        } else if score <= self.reduced {
            DegradationLevel::Reduced
        } else {
            DegradationLevel::Full
        }
    }

    /// Upper bound of the score band for a level, `None` for FULL.
    ///
    /// Recovery out of a level requires the score to strictly exceed this
    /// bound (hysteresis).
    #[must_use]
    pub fn upper_bound(&self, level: DegradationLevel) -> Option<f64> {
        match level {
            DegradationLevel::Full => None,
            DegradationLevel::Reduced => Some(self.reduced),
            DegradationLevel::Minimal => Some(self.minimal),
            DegradationLevel::Emergency => Some(self.emergency),
        }
    }

    /// Coarse status classification for a score.
    #[must_use]
    pub fn status_for(&self, score: f64) -> HealthStatus {
        if score <= self.emergency {
            HealthStatus::Unhealthy
        } else if score <= self.reduced {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Receives every published [`HealthSample`].
///
/// Delivery is at-least-once per subscriber with no ordering guarantee
/// across subscribers. Implementations must not block the poll loop.
pub trait HealthSubscriber: Send + Sync {
    /// Called with each new sample.
    fn on_health_sample(&self, sample: &HealthSample);
}

type CheckFn = dyn Fn() -> Result<f64, String> + Send + Sync;

struct RegisteredCheck {
    name: String,
    critical: bool,
    check: Box<CheckFn>,
}

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct HealthMonitorConfig {
    /// Interval between polls (default: 5s).
    pub check_interval: Duration,
    /// Samples retained for trend reporting (default: 120).
    pub history_cap: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            history_cap: HEALTH_HISTORY_CAP,
        }
    }
}

impl HealthMonitorConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Sets the rolling-history capacity.
    #[must_use]
    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap.max(2);
        self
    }
}

/// Periodically aggregates registered health checks into one system score.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    thresholds: HealthThresholds,
    checks: RwLock<Vec<Arc<RegisteredCheck>>>,
    subscribers: RwLock<Vec<Arc<dyn HealthSubscriber>>>,
    latest: RwLock<Option<HealthSample>>,
    history: Mutex<VecDeque<f64>>,
    shutdown_tx: watch::Sender<bool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("checks", &self.checks.read().len())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Creates a new monitor with the given configuration.
    #[must_use]
    pub fn new(config: HealthMonitorConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            thresholds: HealthThresholds::default(),
            checks: RwLock::new(Vec::new()),
            subscribers: RwLock::new(Vec::new()),
            latest: RwLock::new(None),
            history: Mutex::new(VecDeque::new()),
            shutdown_tx,
            poller: Mutex::new(None),
        }
    }

    /// Sets the thresholds used for status classification.
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// The threshold configuration in effect.
    #[must_use]
    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    /// Registers a health-check callback returning a 0-100 sub-score.
    ///
    /// A critical check that fails (error, panic, or 0 score) vetoes the
    /// combined score to 0. Errors and panics in any callback are caught
    /// and scored 0, never crashing the monitor.
    pub fn register_check<F>(&self, name: impl Into<String>, critical: bool, check: F)
    where
        F: Fn() -> Result<f64, String> + Send + Sync + 'static,
    {
        self.checks.write().push(Arc::new(RegisteredCheck {
            name: name.into(),
            critical,
            check: Box::new(check),
        }));
    }

    /// Registers a "circuit-breakers" check backed by the manager's
    /// aggregate health score.
    pub fn attach_breaker_manager(&self, breakers: &Arc<CircuitBreakerManager>) {
        let breakers = Arc::clone(breakers);
        self.register_check("circuit-breakers", false, move || {
            Ok(breakers.overall_health())
        });
    }

    /// Registers a "recovery" check backed by the healer's success rate.
    pub fn attach_healer(&self, healer: &Arc<SelfHealer>) {
        let healer = Arc::clone(healer);
        self.register_check("recovery", false, move || Ok(healer.success_rate() * 100.0));
    }

    /// Subscribes to every published sample.
    pub fn subscribe(&self, subscriber: Arc<dyn HealthSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Runs one poll cycle synchronously and publishes the sample.
    ///
    /// The background loop calls this on every tick; tests and the chaos
    /// harness call it directly for deterministic sampling.
    pub fn poll_once(&self) -> HealthSample {
        let checks: Vec<_> = self.checks.read().iter().map(Arc::clone).collect();

        let mut signals = HashMap::with_capacity(checks.len());
        let mut vetoed = false;
        for check in &checks {
            let score = match catch_unwind(AssertUnwindSafe(|| (check.check)())) {
                Ok(Ok(score)) => score.clamp(0.0, 100.0),
                Ok(Err(e)) => {
                    tracing::warn!(check = %check.name, error = %e, "health check failed");
                    0.0
                }
                Err(_) => {
                    tracing::warn!(check = %check.name, "health check panicked");
                    0.0
                }
            };
            if check.critical && score <= 0.0 {
                vetoed = true;
            }
            signals.insert(check.name.clone(), score);
        }

        let score = if vetoed {
            0.0
        } else if signals.is_empty() {
            // An empty monitor must not trip degradation at startup.
            100.0
        } else {
            signals.values().sum::<f64>() / signals.len() as f64
        };

        let sample = HealthSample {
            score,
            computed_at: Utc::now(),
            signals,
        };

        {
            let mut history = self.history.lock();
            if history.len() >= self.config.history_cap {
                history.pop_front();
            }
            history.push_back(score);
        }
        *self.latest.write() = Some(sample.clone());

        tracing::debug!(score, "health sample computed");

        let subscribers: Vec<_> = self.subscribers.read().iter().map(Arc::clone).collect();
        for subscriber in subscribers {
            subscriber.on_health_sample(&sample);
        }

        sample
    }

    /// Starts the background poll loop.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.poller.lock();
        if guard.is_some() {
            return;
        }
        self.shutdown_tx.send_replace(false);
        let monitor = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.poll_once();
                    }
                    _ = shutdown.changed() => return,
                }
            }
        }));
    }

    /// Stops the background poll loop.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.poller.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Latest combined score and status, without blocking.
    ///
    /// Reports full health before the first poll completes.
    #[must_use]
    pub fn system_health(&self) -> SystemHealth {
        let score = self
            .latest
            .read()
            .as_ref()
            .map_or(100.0, |sample| sample.score);
        SystemHealth {
            score,
            status: self.thresholds.status_for(score),
        }
    }

    /// Latest full sample, if any poll has completed.
    #[must_use]
    pub fn latest_sample(&self) -> Option<HealthSample> {
        self.latest.read().clone()
    }

    /// Direction the score has moved over the rolling history.
    #[must_use]
    pub fn trend(&self) -> HealthTrend {
        let history = self.history.lock();
        if history.len() < 4 {
            return HealthTrend::Stable;
        }
        let mid = history.len() / 2;
        let older: f64 = history.iter().take(mid).sum::<f64>() / mid as f64;
        let newer: f64 =
            history.iter().skip(mid).sum::<f64>() / (history.len() - mid) as f64;
        let delta = newer - older;
        if delta > 2.0 {
            HealthTrend::Improving
        } else if delta < -2.0 {
            HealthTrend::Degrading
        } else {
            HealthTrend::Stable
        }
    }
}
