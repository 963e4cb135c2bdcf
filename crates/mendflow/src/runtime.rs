// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Wiring for the four resilience collaborators.
//!
//! [`ResilienceCore`] assembles the breaker manager, self-healer, health
//! monitor, and degradation engine around one shared event bus, with the
//! cross-links the components expect: the healer consults the breaker
//! manager before retries, the monitor scores breaker and recovery health,
//! and the degradation engine subscribes to health samples.
//!
//! The surrounding platform supplies all configuration at construction;
//! nothing here reads files or environment variables.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mendflow::runtime::ResilienceCore;
//!
//! let core = ResilienceCore::builder()
//!     .with_feature_registry(registry)
//!     .build();
//! core.start();
//!
//! let result = core.breakers.execute("payments-api", || call()).await;
//! // ...
//! core.shutdown().await;
//! ```

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager};
use crate::constants::DEFAULT_EVENT_CAPACITY;
use crate::degradation::{FeatureRegistry, GracefulDegradation, GracefulDegradationConfig};
use crate::events::{EventBus, EventStream};
use crate::healer::{FailureCategory, RecoveryStrategy, SelfHealer, SelfHealerConfig};
use crate::health::{HealthMonitor, HealthMonitorConfig, HealthSubscriber, HealthThresholds};
use std::sync::Arc;

/// Builder for [`ResilienceCore`].
#[derive(Debug, Default)]
pub struct ResilienceCoreBuilder {
    breaker_config: CircuitBreakerConfig,
    healer_config: SelfHealerConfig,
    monitor_config: HealthMonitorConfig,
    degradation_config: GracefulDegradationConfig,
    registry: FeatureRegistry,
    strategies: Vec<(FailureCategory, RecoveryStrategy)>,
    default_strategy: Option<RecoveryStrategy>,
    event_capacity: usize,
}

impl ResilienceCoreBuilder {
    /// Creates a builder with default configuration throughout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            ..Self::default()
        }
    }

    /// Sets the default configuration for new breakers.
    #[must_use]
    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Sets the self-healer configuration.
    #[must_use]
    pub fn with_healer_config(mut self, config: SelfHealerConfig) -> Self {
        self.healer_config = config;
        self
    }

    /// Sets the health monitor configuration.
    #[must_use]
    pub fn with_monitor_config(mut self, config: HealthMonitorConfig) -> Self {
        self.monitor_config = config;
        self
    }

    /// Sets the degradation engine configuration.
    #[must_use]
    pub fn with_degradation_config(mut self, config: GracefulDegradationConfig) -> Self {
        self.degradation_config = config;
        self
    }

    /// Sets the thresholds shared by the monitor and the degradation engine.
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.degradation_config = self.degradation_config.with_thresholds(thresholds);
        self
    }

    /// Sets the feature registry gated by degradation.
    #[must_use]
    pub fn with_feature_registry(mut self, registry: FeatureRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the recovery strategy for one failure category.
    #[must_use]
    pub fn with_strategy(mut self, category: FailureCategory, strategy: RecoveryStrategy) -> Self {
        self.strategies.push((category, strategy));
        self
    }

    /// Sets the strategy for categories without an explicit one.
    #[must_use]
    pub fn with_default_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.default_strategy = Some(strategy);
        self
    }

    /// Sets the event bus buffer capacity.
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Assembles the core. Background loops stay stopped until
    /// [`ResilienceCore::start`].
    #[must_use]
    pub fn build(self) -> ResilienceCore {
        let events = EventBus::with_capacity(self.event_capacity);

        let breakers = Arc::new(
            CircuitBreakerManager::new()
                .with_default_config(self.breaker_config)
                .with_event_bus(events.clone()),
        );

        let mut healer = SelfHealer::new(self.healer_config)
            .with_event_bus(events.clone())
            .with_breaker_manager(Arc::clone(&breakers));
        for (category, strategy) in self.strategies {
            healer = healer.with_strategy(category, strategy);
        }
        if let Some(strategy) = self.default_strategy {
            healer = healer.with_default_strategy(strategy);
        }
        let healer = Arc::new(healer);

        let monitor = Arc::new(
            HealthMonitor::new(self.monitor_config)
                .with_thresholds(self.degradation_config.thresholds),
        );
        monitor.attach_breaker_manager(&breakers);
        monitor.attach_healer(&healer);

        let degradation = Arc::new(
            GracefulDegradation::new(self.degradation_config, self.registry)
                .with_event_bus(events.clone()),
        );
        monitor.subscribe(Arc::clone(&degradation) as Arc<dyn HealthSubscriber>);

        ResilienceCore {
            events,
            breakers,
            healer,
            monitor,
            degradation,
        }
    }
}

/// The assembled resilience core.
#[derive(Debug)]
pub struct ResilienceCore {
    /// Shared event bus all components publish to.
    pub events: EventBus,
    /// Per-dependency circuit breakers.
    pub breakers: Arc<CircuitBreakerManager>,
    /// Failure detection and recovery.
    pub healer: Arc<SelfHealer>,
    /// Health aggregation.
    pub monitor: Arc<HealthMonitor>,
    /// Feature gating by degradation level.
    pub degradation: Arc<GracefulDegradation>,
}

impl ResilienceCore {
    /// Starts building a core.
    #[must_use]
    pub fn builder() -> ResilienceCoreBuilder {
        ResilienceCoreBuilder::new()
    }

    /// Starts the background loops: recovery dispatch, health polling, and
    /// degradation recovery checks.
    pub fn start(&self) {
        self.healer.start();
        self.monitor.start();
        self.degradation.start();
    }

    /// Stops the background loops; in-flight recoveries finish or time out.
    pub async fn shutdown(&self) {
        self.monitor.shutdown().await;
        self.degradation.shutdown().await;
        self.healer.shutdown().await;
    }

    /// Subscribes to the resilience event stream.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::degradation::{DegradationLevel, Feature};
    use crate::healer::{FailureSeverity, OnExhausted, RetryPolicy};
    use std::time::Duration;

    #[tokio::test]
    async fn test_builder_wires_components() {
        let core = ResilienceCore::builder()
            .with_feature_registry(FeatureRegistry::new().with_feature(
                Feature::new("analytics", 50)
                    .with_disabled_levels([DegradationLevel::Emergency]),
            ))
            .with_default_strategy(RecoveryStrategy::Retry {
                policy: RetryPolicy::new()
                    .with_max_attempts(1)
                    .with_initial_delay(Duration::from_millis(1)),
                on_exhausted: OnExhausted::Fail,
            })
            .build();

        // Breaker failures flow into the monitor's "circuit-breakers" signal.
        let breaker = core.breakers.get_or_create_with_config(
            "db",
            CircuitBreakerConfig::new().with_failure_threshold(1),
        );
        breaker.record_failure(Some("down"));

        let sample = core.monitor.poll_once();
        assert!(sample.signals.contains_key("circuit-breakers"));
        assert!(sample.score < 100.0);

        // Healer runs and records statistics without the loops started.
        let record = core.healer.detect_failure(
            crate::healer::FailureCategory::Service,
            "svc",
            "blip",
            FailureSeverity::Low,
        );
        let result = core.healer.heal(record.id).await.unwrap();
        assert!(!result.success);
        assert_eq!(core.healer.stats().total_failed, 1);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let core = ResilienceCore::builder().build();
        core.start();
        // Idempotent start.
        core.start();
        core.shutdown().await;
    }
}
