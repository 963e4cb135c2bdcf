// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Graceful Degradation: priority-ordered feature shedding.
//!
//! The [`GracefulDegradation`] engine maintains the current degradation
//! level (FULL / REDUCED / MINIMAL / EMERGENCY) and a static feature
//! registry. As system health crosses thresholds it disables features whose
//! registration marks them expendable at the new level, and re-enables them
//! in descending priority order once health recovers past the hysteresis
//! bound.
//!
//! Degrading reacts immediately to health samples; recovering runs on its
//! own poll so a single good sample cannot flap the system back and forth.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mendflow::degradation::{
//!     DegradationLevel, Feature, FeatureRegistry, GracefulDegradation,
//!     GracefulDegradationConfig,
//! };
//!
//! let registry = FeatureRegistry::new()
//!     .with_feature(
//!         Feature::new("advanced-analytics", 50)
//!             .with_disabled_levels([DegradationLevel::Minimal, DegradationLevel::Emergency]),
//!     );
//! let degradation = Arc::new(GracefulDegradation::new(
//!     GracefulDegradationConfig::default(),
//!     registry,
//! ));
//! monitor.subscribe(Arc::clone(&degradation) as Arc<dyn HealthSubscriber>);
//! degradation.start();
//!
//! if degradation.is_feature_enabled("advanced-analytics") {
//!     run_analytics();
//! }
//! ```

use crate::constants::DEFAULT_RECOVERY_CHECK_INTERVAL;
use crate::events::{EventBus, ResilienceEvent};
use crate::health::{HealthSample, HealthSubscriber, HealthThresholds};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Degradation level, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    /// All features active.
    Full,
    /// Non-essential features shed.
    Reduced,
    /// Only important features remain.
    Minimal,
    /// Bare minimum to stay up.
    Emergency,
}

impl DegradationLevel {
    /// Whether this level sheds any functionality.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !matches!(self, Self::Full)
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Reduced => write!(f, "reduced"),
            Self::Minimal => write!(f, "minimal"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// What caused a degradation transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationTrigger {
    /// Driven by a health sample or the recovery poll.
    Automatic,
    /// Driven by an operator call.
    Manual,
}

/// Registry entry for one gateable feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    /// Feature name consulted by gated code paths.
    pub name: String,
    /// Higher priority features are preserved longer and re-enabled first.
    pub priority: u32,
    /// Levels at which this feature must be disabled.
    pub degradation_levels: HashSet<DegradationLevel>,
    /// Features that must be enabled before this one is re-enabled.
    pub depends_on: HashSet<String>,
}

impl Feature {
    /// Creates a feature with the given name and priority.
    #[must_use]
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            degradation_levels: HashSet::new(),
            depends_on: HashSet::new(),
        }
    }

    /// Sets the levels at which this feature is disabled.
    #[must_use]
    pub fn with_disabled_levels(
        mut self,
        levels: impl IntoIterator<Item = DegradationLevel>,
    ) -> Self {
        self.degradation_levels = levels.into_iter().collect();
        self
    }

    /// Sets the features this one depends on.
    #[must_use]
    pub fn with_depends_on(
        mut self,
        deps: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this feature must be disabled at `level`.
    #[must_use]
    pub fn disabled_at(&self, level: DegradationLevel) -> bool {
        self.degradation_levels.contains(&level)
    }
}

/// Static registry of gateable features, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct FeatureRegistry {
    features: HashMap<String, Feature>,
}

impl FeatureRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a feature (builder form).
    #[must_use]
    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.register(feature);
        self
    }

    /// Adds a feature.
    pub fn register(&mut self, feature: Feature) {
        self.features.insert(feature.name.clone(), feature);
    }

    /// Looks up a feature by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Feature> {
        self.features.get(name)
    }

    /// Number of registered features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Returns `true` if no features are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Names of the features that must be disabled at `level`.
    #[must_use]
    pub fn disabled_for(&self, level: DegradationLevel) -> HashSet<String> {
        self.features
            .values()
            .filter(|f| f.disabled_at(level))
            .map(|f| f.name.clone())
            .collect()
    }

    fn priority_of(&self, name: &str) -> u32 {
        self.features.get(name).map_or(0, |f| f.priority)
    }
}

/// The current degradation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationState {
    /// Current level.
    pub level: DegradationLevel,
    /// Features currently disabled.
    pub disabled_features: HashSet<String>,
    /// Why the last transition happened.
    pub reason: String,
    /// What drove the last transition.
    pub trigger: DegradationTrigger,
    /// When the last transition happened.
    pub changed_at: DateTime<Utc>,
}

/// Configuration for the degradation engine.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct GracefulDegradationConfig {
    /// Interval between recovery checks (default: 10s).
    pub recovery_check_interval: Duration,
    /// Score thresholds mapping health to target levels.
    pub thresholds: HealthThresholds,
    /// Whether health samples drive degradation automatically (default: true).
    pub auto_degrade: bool,
}

impl Default for GracefulDegradationConfig {
    fn default() -> Self {
        Self {
            recovery_check_interval: DEFAULT_RECOVERY_CHECK_INTERVAL,
            thresholds: HealthThresholds::default(),
            auto_degrade: true,
        }
    }
}

impl GracefulDegradationConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the recovery poll interval.
    #[must_use]
    pub fn with_recovery_check_interval(mut self, interval: Duration) -> Self {
        self.recovery_check_interval = interval;
        self
    }

    /// Sets the health thresholds.
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Enables or disables automatic degradation from health samples.
    #[must_use]
    pub fn with_auto_degrade(mut self, auto: bool) -> Self {
        self.auto_degrade = auto;
        self
    }
}

/// Maintains the degradation level and the disabled-feature set.
///
/// All transitions are serialized under one mutex so `disabled_features`
/// can never be observed mid-recomputation. Degradation transitions are
/// protective reactions: they always succeed.
pub struct GracefulDegradation {
    config: GracefulDegradationConfig,
    registry: FeatureRegistry,
    state: Mutex<DegradationState>,
    /// Features disabled by explicit operator request, kept disabled across
    /// automatic degrade transitions until a recovery re-enables them.
    manual_overrides: Mutex<HashSet<String>>,
    latest_score: RwLock<Option<f64>>,
    events: Option<EventBus>,
    shutdown_tx: watch::Sender<bool>,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for GracefulDegradation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GracefulDegradation")
            .field("level", &self.current_level())
            .field("features", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl GracefulDegradation {
    /// Creates the engine at FULL with the given feature registry.
    #[must_use]
    pub fn new(config: GracefulDegradationConfig, registry: FeatureRegistry) -> Self {
        let disabled = registry.disabled_for(DegradationLevel::Full);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            registry,
            state: Mutex::new(DegradationState {
                level: DegradationLevel::Full,
                disabled_features: disabled,
                reason: "startup".to_string(),
                trigger: DegradationTrigger::Automatic,
                changed_at: Utc::now(),
            }),
            manual_overrides: Mutex::new(HashSet::new()),
            latest_score: RwLock::new(None),
            events: None,
            shutdown_tx,
            recovery_task: Mutex::new(None),
        }
    }

    /// Attaches an event bus; transitions are published to it.
    #[must_use]
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// The current degradation level.
    #[must_use]
    pub fn current_level(&self) -> DegradationLevel {
        self.state.lock().level
    }

    /// Snapshot of the full degradation state.
    #[must_use]
    pub fn current_state(&self) -> DegradationState {
        self.state.lock().clone()
    }

    /// Whether a feature is currently enabled. Unknown features are enabled.
    #[must_use]
    pub fn is_feature_enabled(&self, name: &str) -> bool {
        !self.state.lock().disabled_features.contains(name)
    }

    /// Manually moves to `level` (either direction), recomputing the
    /// disabled set the same way automatic transitions do.
    pub fn degrade(&self, level: DegradationLevel, reason: impl Into<String>) {
        self.degrade_with(level, reason, DegradationTrigger::Manual, &[]);
    }

    /// Manually moves to `level`, additionally disabling
    /// `explicit_features`. Explicit features stay disabled across further
    /// degrade transitions and are re-enabled by the next recovery.
    pub fn degrade_with(
        &self,
        level: DegradationLevel,
        reason: impl Into<String>,
        trigger: DegradationTrigger,
        explicit_features: &[String],
    ) {
        let reason = reason.into();
        let state = self.state.lock();
        if level >= state.level {
            self.manual_overrides
                .lock()
                .extend(explicit_features.iter().cloned());
            self.apply_degrade(state, level, reason, trigger);
        } else {
            self.apply_recover(state, level, reason, trigger);
        }
    }

    /// Feeds a health score into the engine; degrades immediately when the
    /// target level is more severe than the current one.
    fn observe_score(&self, score: f64) {
        *self.latest_score.write() = Some(score);
        if !self.config.auto_degrade {
            return;
        }
        let target = self.config.thresholds.target_level(score);
        let state = self.state.lock();
        if target > state.level {
            self.apply_degrade(
                state,
                target,
                format!("health score {score:.1} at or below threshold"),
                DegradationTrigger::Automatic,
            );
        }
    }

    /// Runs one recovery check: with the score strictly above the current
    /// level's upper bound, recover toward the level the score maps to;
    /// otherwise retry features skipped earlier for unmet dependencies.
    ///
    /// The background loop calls this on every tick; tests and the chaos
    /// harness call it directly for deterministic stepping.
    pub fn recovery_tick(&self) {
        let Some(score) = *self.latest_score.read() else {
            return;
        };
        let state = self.state.lock();
        if let Some(upper) = self.config.thresholds.upper_bound(state.level) {
            // Hysteresis: reaching the trigger threshold again is not
            // enough; the score must clear the whole band.
            if score > upper {
                let target = self.config.thresholds.target_level(score);
                if target < state.level {
                    self.apply_recover(
                        state,
                        target,
                        format!("health score {score:.1} above {upper:.1}"),
                        DegradationTrigger::Automatic,
                    );
                    return;
                }
            }
        }
        self.retry_skipped(state);
    }

    /// Starts the background recovery poll.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.recovery_task.lock();
        if guard.is_some() {
            return;
        }
        self.shutdown_tx.send_replace(false);
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.recovery_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.recovery_tick();
                    }
                    _ = shutdown.changed() => return,
                }
            }
        }));
    }

    /// Stops the background recovery poll.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.recovery_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn apply_degrade(
        &self,
        mut state: MutexGuard<'_, DegradationState>,
        level: DegradationLevel,
        reason: String,
        trigger: DegradationTrigger,
    ) {
        let mut disabled = self.registry.disabled_for(level);
        disabled.extend(self.manual_overrides.lock().iter().cloned());

        let mut newly: Vec<String> = disabled
            .difference(&state.disabled_features)
            .cloned()
            .collect();
        newly.sort();

        if level == state.level && newly.is_empty() {
            // Idempotent: repeating a degrade changes nothing and emits nothing.
            return;
        }

        state.level = level;
        state.disabled_features = disabled;
        state.reason = reason.clone();
        state.trigger = trigger;
        state.changed_at = Utc::now();
        drop(state);

        tracing::warn!(
            level = %level,
            disabled = ?newly,
            reason = %reason,
            "degradation activated"
        );
        self.publish(ResilienceEvent::DegradationActivated {
            level,
            disabled: newly,
            reason,
            timestamp: Utc::now(),
        });
    }

    fn apply_recover(
        &self,
        mut state: MutexGuard<'_, DegradationState>,
        target: DegradationLevel,
        reason: String,
        trigger: DegradationTrigger,
    ) {
        self.manual_overrides.lock().clear();
        let base_disabled = self.registry.disabled_for(target);

        // Candidates come back in descending priority order; a feature is
        // skipped while anything it depends on is still disabled.
        let mut candidates: Vec<String> = state
            .disabled_features
            .difference(&base_disabled)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            self.registry
                .priority_of(b)
                .cmp(&self.registry.priority_of(a))
                .then_with(|| a.cmp(b))
        });

        let mut still_disabled: HashSet<String> = base_disabled;
        still_disabled.extend(candidates.iter().cloned());

        let mut reenabled = Vec::new();
        for name in &candidates {
            let blocked = self.registry.get(name).map_or(false, |f| {
                f.depends_on.iter().any(|dep| still_disabled.contains(dep))
            });
            if blocked {
                tracing::debug!(feature = %name, "re-enable skipped, dependency still disabled");
                continue;
            }
            still_disabled.remove(name);
            reenabled.push(name.clone());
        }

        state.level = target;
        state.disabled_features = still_disabled;
        state.reason = reason.clone();
        state.trigger = trigger;
        state.changed_at = Utc::now();
        drop(state);

        tracing::info!(
            level = %target,
            reenabled = ?reenabled,
            reason = %reason,
            "degradation recovered"
        );
        self.publish(ResilienceEvent::DegradationRecovered {
            level: target,
            reenabled,
            reason,
            timestamp: Utc::now(),
        });
    }

    /// Re-enables features left disabled only because a dependency was
    /// still down when their level transition happened.
    fn retry_skipped(&self, mut state: MutexGuard<'_, DegradationState>) {
        let mut mandated = self.registry.disabled_for(state.level);
        mandated.extend(self.manual_overrides.lock().iter().cloned());

        let mut candidates: Vec<String> = state
            .disabled_features
            .difference(&mandated)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return;
        }
        candidates.sort_by(|a, b| {
            self.registry
                .priority_of(b)
                .cmp(&self.registry.priority_of(a))
                .then_with(|| a.cmp(b))
        });

        let mut disabled = state.disabled_features.clone();
        let mut reenabled = Vec::new();
        for name in &candidates {
            let blocked = self.registry.get(name).map_or(false, |f| {
                f.depends_on.iter().any(|dep| disabled.contains(dep))
            });
            if blocked {
                continue;
            }
            disabled.remove(name);
            reenabled.push(name.clone());
        }

        if reenabled.is_empty() {
            return;
        }

        let level = state.level;
        state.disabled_features = disabled;
        state.changed_at = Utc::now();
        drop(state);

        tracing::info!(level = %level, reenabled = ?reenabled, "skipped features re-enabled");
        self.publish(ResilienceEvent::DegradationRecovered {
            level,
            reenabled,
            reason: "dependencies satisfied".to_string(),
            timestamp: Utc::now(),
        });
    }

    fn publish(&self, event: ResilienceEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

impl HealthSubscriber for GracefulDegradation {
    fn on_health_sample(&self, sample: &HealthSample) {
        self.observe_score(sample.score);
    }
}
