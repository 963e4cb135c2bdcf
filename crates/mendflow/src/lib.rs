// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # MendFlow - Resilience & Self-Healing Core
//!
//! MendFlow protects an orchestration platform against partial failures by
//! isolating faulty dependencies, automatically attempting recovery, and
//! shedding non-critical functionality while health is degraded.
//!
//! ## Components
//!
//! - [`circuit_breaker`] - per-dependency breakers (CLOSED / OPEN /
//!   HALF-OPEN) behind a keyed [`CircuitBreakerManager`] with an aggregate
//!   health score
//! - [`healer`] - the [`SelfHealer`]: failure classification, bounded
//!   concurrent recovery via retry / fallback / restore strategies, and
//!   escalation of exhausted recoveries
//! - [`health`] - the [`HealthMonitor`]: periodic polling of registered
//!   checks into one 0-100 system score with subscriber notification
//! - [`degradation`] - the [`GracefulDegradation`] engine: FULL / REDUCED /
//!   MINIMAL / EMERGENCY levels gating a priority-ordered feature registry
//! - [`events`] - the typed [`ResilienceEvent`] stream all four publish to
//! - [`runtime`] - [`ResilienceCore`], which wires the collaborators
//!   together the way the platform consumes them
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mendflow::prelude::*;
//!
//! let core = ResilienceCore::builder()
//!     .with_feature_registry(
//!         FeatureRegistry::new().with_feature(
//!             Feature::new("advanced-analytics", 50)
//!                 .with_disabled_levels([DegradationLevel::Minimal, DegradationLevel::Emergency]),
//!         ),
//!     )
//!     .build();
//! core.start();
//!
//! // Wrap risky calls per dependency.
//! let reply = core.breakers.execute("payments-api", || call_payments()).await;
//!
//! // Report failures for automatic recovery.
//! if let Err(e) = &reply {
//!     if !e.is_circuit_open() {
//!         core.healer.detect_failure(
//!             FailureCategory::Network,
//!             "payments-api",
//!             e.to_string(),
//!             FailureSeverity::High,
//!         );
//!     }
//! }
//!
//! // Gate non-critical paths.
//! if core.degradation.is_feature_enabled("advanced-analytics") {
//!     run_analytics();
//! }
//! ```

pub mod circuit_breaker;
pub mod constants;
pub mod degradation;
pub mod error;
pub mod events;
pub mod healer;
pub mod health;
pub mod runtime;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerManager,
    CircuitBreakerStats, CircuitOpenError, CircuitState,
};
pub use degradation::{
    DegradationLevel, DegradationState, DegradationTrigger, Feature, FeatureRegistry,
    GracefulDegradation, GracefulDegradationConfig,
};
pub use error::{ResilienceError, Result};
pub use events::{EventBus, EventStream, ResilienceEvent};
pub use healer::{
    recovery_fn, AlertHandler, CategoryStats, CheckpointSource, FailureCategory, FailureRecord,
    FailureSeverity, FailureStatus, FallbackProducer, HealerStats, OnExhausted, RecoveryAction,
    RecoveryResult, RecoveryStrategy, RetryPolicy, SelfHealer, SelfHealerConfig,
};
pub use health::{
    HealthMonitor, HealthMonitorConfig, HealthSample, HealthStatus, HealthSubscriber,
    HealthThresholds, HealthTrend, SystemHealth,
};
pub use runtime::{ResilienceCore, ResilienceCoreBuilder};

/// Commonly used items, re-exported in one place.
pub mod prelude {
    pub use crate::circuit_breaker::{
        CircuitBreakerConfig, CircuitBreakerManager, CircuitState,
    };
    pub use crate::degradation::{
        DegradationLevel, Feature, FeatureRegistry, GracefulDegradation,
        GracefulDegradationConfig,
    };
    pub use crate::events::{EventBus, ResilienceEvent};
    pub use crate::healer::{
        recovery_fn, FailureCategory, FailureSeverity, OnExhausted, RecoveryStrategy,
        RetryPolicy, SelfHealer, SelfHealerConfig,
    };
    pub use crate::health::{
        HealthMonitor, HealthMonitorConfig, HealthSubscriber, HealthThresholds,
    };
    pub use crate::runtime::{ResilienceCore, ResilienceCoreBuilder};
}
