//! Property Tests for the Circuit Breaker State Machine
//!
//! These properties pin the monotonic behavior of breaker transitions under
//! arbitrary success/failure sequences, independent of timing: the timeout
//! is set far beyond test runtime so the open-to-half-open edge never fires.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use mendflow::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use mendflow::healer::RetryPolicy;
use proptest::prelude::*;
use std::time::Duration;

fn untimed_breaker(failure_threshold: u32) -> CircuitBreaker {
    CircuitBreaker::with_config(
        "prop",
        CircuitBreakerConfig::new()
            .with_failure_threshold(failure_threshold)
            .with_timeout(Duration::from_secs(3600)),
    )
}

proptest! {
    /// The breaker opens after exactly `threshold` consecutive failures,
    /// never earlier.
    #[test]
    fn prop_trips_exactly_at_threshold(threshold in 1u32..8) {
        let breaker = untimed_breaker(threshold);

        for i in 0..threshold - 1 {
            breaker.record_failure(Some("fault"));
            prop_assert_eq!(breaker.state(), CircuitState::Closed, "failure {}", i);
        }
        breaker.record_failure(Some("fault"));
        prop_assert_eq!(breaker.state(), CircuitState::Open);
        prop_assert!(!breaker.can_execute());
    }

    /// Under any success/failure sequence: a closed breaker has fewer
    /// consecutive failures than its threshold, an open breaker rejects
    /// calls, and no success sequence reopens a closed breaker.
    #[test]
    fn prop_state_invariants_hold(
        outcomes in prop::collection::vec(any::<bool>(), 0..120),
        threshold in 1u32..6,
    ) {
        let breaker = untimed_breaker(threshold);

        for &success in &outcomes {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure(Some("fault"));
            }

            match breaker.state() {
                CircuitState::Closed => {
                    prop_assert!(breaker.failure_count() < threshold);
                    prop_assert!(breaker.can_execute());
                }
                CircuitState::Open => {
                    prop_assert!(!breaker.can_execute());
                }
                CircuitState::HalfOpen => {
                    // Timeout is an hour out; this edge must never fire here.
                    prop_assert!(false, "half-open without timeout elapsing");
                }
            }
        }
    }

    /// Once open (and before the timeout), the breaker stays open no matter
    /// how many successes are recorded against it.
    #[test]
    fn prop_open_is_sticky_under_successes(successes in 0usize..40) {
        let breaker = untimed_breaker(1);
        breaker.record_failure(Some("fault"));
        prop_assert_eq!(breaker.state(), CircuitState::Open);

        for _ in 0..successes {
            breaker.record_success();
            prop_assert_eq!(breaker.state(), CircuitState::Open);
        }
    }

    /// Retry delays never exceed the cap and never shrink as attempts grow.
    #[test]
    fn prop_retry_delays_monotone_and_capped(
        initial_ms in 1u64..500,
        multiplier in 1.0f64..4.0,
        max_ms in 1u64..2000,
        attempt in 0u32..15,
    ) {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(initial_ms))
            .with_backoff_multiplier(multiplier)
            .with_max_delay(Duration::from_millis(max_ms));

        let current = policy.delay_for(attempt);
        let next = policy.delay_for(attempt + 1);
        prop_assert!(current <= Duration::from_millis(max_ms));
        prop_assert!(next >= current);
    }
}
