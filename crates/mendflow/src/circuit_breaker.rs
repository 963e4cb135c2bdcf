// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

// Allow clippy warnings for the breaker module
// - expect: CircuitBreakerError::into_inner panics by contract on the CircuitOpen variant
#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Circuit Breaker Pattern for External Calls.
//!
//! A circuit breaker wraps a unit of work against one dependency and fails
//! fast once that dependency has proven unhealthy, instead of letting every
//! caller wait on a dead service. Breakers are keyed by dependency and
//! fully independent: a tripped breaker for dependency A never affects
//! calls to dependency B.
//!
//! ## States
//!
//! - **Closed**: normal operation, calls pass through
//! - **Open**: circuit tripped, calls fail immediately without attempting the operation
//! - **Half-Open**: after the timeout, a bounded number of concurrent trial
//!   calls probe whether the dependency recovered
//!
//! ## Example
//!
//! ```rust,ignore
//! use mendflow::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager};
//!
//! let manager = CircuitBreakerManager::new();
//! let result = manager
//!     .execute("payments-api", || async { call_payments().await })
//!     .await;
//!
//! match result {
//!     Ok(response) => handle(response),
//!     Err(e) if e.is_circuit_open() => serve_cached(),
//!     Err(e) => log_failure(e),
//! }
//! ```

use crate::constants::{
    BREAKER_HISTORY_CAP, DEFAULT_BREAKER_TIMEOUT, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_HALF_OPEN_REQUESTS, DEFAULT_SUCCESS_THRESHOLD,
};
use crate::events::{EventBus, ResilienceEvent};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// The current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation state. Calls pass through to the underlying service.
    /// The circuit transitions to [`Open`](Self::Open) after reaching the failure threshold.
    Closed,
    /// Circuit tripped due to failures. All calls fail immediately without attempting
    /// the underlying operation. After the timeout, transitions to [`HalfOpen`](Self::HalfOpen).
    Open,
    /// Testing state after the timeout expires. A bounded number of concurrent trial
    /// calls are allowed through. Enough successes close the circuit; any failure reopens it.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit (default: 5).
    pub failure_threshold: u32,
    /// Consecutive successes in half-open state required to close the circuit (default: 2).
    pub success_threshold: u32,
    /// Duration to wait before transitioning from open to half-open state (default: 30s).
    pub timeout: Duration,
    /// Concurrent trial calls admitted while half-open (default: 3).
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            timeout: DEFAULT_BREAKER_TIMEOUT,
            half_open_requests: DEFAULT_HALF_OPEN_REQUESTS,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of failures required to open the circuit.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Sets the number of successes in half-open state required to close the circuit.
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Sets the timeout before the open to half-open transition.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the number of concurrent trial calls admitted while half-open.
    #[must_use]
    pub fn with_half_open_requests(mut self, requests: u32) -> Self {
        self.half_open_requests = requests.max(1);
        self
    }
}

/// Circuit breaker specific error type.
///
/// Returned when the breaker rejects a call without invoking the operation,
/// so no side effect occurred.
#[derive(Debug, Clone, Error)]
#[error(
    "circuit '{}' is open (failures: {}, open for: {:?})",
    key,
    failure_count,
    open_duration
)]
pub struct CircuitOpenError {
    /// Key of the circuit that rejected the call.
    pub key: String,
    /// Duration the circuit has been in the open state.
    pub open_duration: Duration,
    /// Consecutive failures recorded when the circuit opened.
    pub failure_count: u32,
    /// The last error message that triggered the circuit to open, if available.
    pub last_error: Option<String>,
}

/// Error type for circuit breaker operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum CircuitBreakerError<E> {
    /// The circuit is open and not accepting calls; the operation was never invoked.
    CircuitOpen(CircuitOpenError),
    /// The underlying operation failed with this error.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircuitOpen(e) => write!(f, "{e}"),
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CircuitOpen(e) => Some(e),
            Self::Inner(e) => Some(e),
        }
    }
}

impl<E> CircuitBreakerError<E> {
    /// Returns `true` if this error is due to an open circuit.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// Returns the circuit open error if this is a `CircuitOpen` variant.
    #[must_use]
    pub fn as_circuit_open(&self) -> Option<&CircuitOpenError> {
        match self {
            Self::CircuitOpen(e) => Some(e),
            Self::Inner(_) => None,
        }
    }

    /// Returns the inner error if this is an `Inner` variant.
    #[must_use]
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::CircuitOpen(_) => None,
            Self::Inner(e) => Some(e),
        }
    }

    /// Consumes the error and returns the inner error.
    ///
    /// # Panics
    ///
    /// Panics if this is a `CircuitOpen` error. Use [`try_into_inner`](Self::try_into_inner)
    /// for a non-panicking alternative.
    pub fn into_inner(self) -> E {
        self.try_into_inner().expect(
            "CircuitBreakerError::into_inner called on CircuitOpen variant (use try_into_inner() for Result)",
        )
    }

    /// Consumes the error and returns the inner error if available.
    ///
    /// Returns `Ok(E)` if this is an `Inner` error, or `Err(CircuitOpenError)`
    /// if this is a `CircuitOpen` error.
    pub fn try_into_inner(self) -> Result<E, CircuitOpenError> {
        match self {
            Self::CircuitOpen(e) => Err(e),
            Self::Inner(e) => Ok(e),
        }
    }
}

/// Interior breaker state. One mutex per breaker keeps transitions
/// linearizable for a key without contending across keys.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    last_error: Option<String>,
    history: VecDeque<(DateTime<Utc>, bool)>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            half_open_in_flight: 0,
            last_error: None,
            history: VecDeque::with_capacity(BREAKER_HISTORY_CAP),
        }
    }

    fn push_outcome(&mut self, success: bool) {
        if self.history.len() >= BREAKER_HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back((Utc::now(), success));
    }

    fn recent_success_rate(&self) -> f64 {
        if self.history.is_empty() {
            return 1.0;
        }
        let successes = self.history.iter().filter(|(_, ok)| *ok).count();
        successes as f64 / self.history.len() as f64
    }
}

/// Admission token returned by the breaker's gate. Half-open trial slots
/// are released on settle; if the caller's future is dropped mid-flight
/// the `Drop` impl returns the slot.
#[derive(Debug)]
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Admission<'_> {
    fn settle(mut self, success: bool, error: Option<&str>) {
        self.settled = true;
        self.breaker.settle(self.trial, success, error);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial();
        }
    }
}

/// A circuit breaker for protecting calls against one dependency.
///
/// # Errors
///
/// - [`CircuitOpenError`] - returned when attempting to call through an open circuit
/// - [`CircuitBreakerError::Inner`] - wraps errors from the underlying operation
///
/// # See Also
///
/// - [`CircuitBreakerConfig`] - thresholds and timeouts
/// - [`CircuitBreakerManager`] - keyed registry of breakers
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with the given key and default configuration.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_config(key, CircuitBreakerConfig::default())
    }

    /// Creates a new circuit breaker with the given key and custom configuration.
    #[must_use]
    pub fn with_config(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            events: None,
        }
    }

    /// Attaches an event bus; state transitions are published to it.
    #[must_use]
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Returns the key of this circuit breaker.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the configuration of this circuit breaker.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current state of the circuit breaker.
    ///
    /// Observing an open breaker past its timeout performs the
    /// open-to-half-open transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.state
    }

    /// Returns whether the circuit would admit a call right now.
    #[must_use]
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.half_open_in_flight < self.config.half_open_requests,
        }
    }

    /// Returns the current consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Returns the current consecutive success count.
    #[must_use]
    pub fn success_count(&self) -> u32 {
        self.inner.lock().consecutive_successes
    }

    /// Returns the last error message that was recorded, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Time until an open breaker starts admitting half-open trials.
    ///
    /// Returns `None` when the breaker is not open.
    #[must_use]
    pub fn remaining_open_time(&self) -> Option<Duration> {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        if inner.state != CircuitState::Open {
            return None;
        }
        inner
            .opened_at
            .map(|at| self.config.timeout.saturating_sub(at.elapsed()))
    }

    /// Records a successful operation, as if a call through the breaker succeeded.
    pub fn record_success(&self) {
        self.settle(false, true, None);
    }

    /// Records a failed operation, as if a call through the breaker failed.
    pub fn record_failure(&self, error: Option<&str>) {
        self.settle(false, false, error);
    }

    /// Executes an async operation through the circuit breaker.
    ///
    /// If the circuit is open (or half-open with all trial slots taken) the
    /// operation is never invoked and a [`CircuitOpenError`] is returned.
    /// Otherwise success or failure is recorded from the result.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let admission = match self.try_acquire() {
            Ok(admission) => admission,
            Err(e) => return Err(CircuitBreakerError::CircuitOpen(e)),
        };

        match f().await {
            Ok(result) => {
                admission.settle(true, None);
                Ok(result)
            }
            Err(e) => {
                admission.settle(false, Some(&e.to_string()));
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Manually forces the circuit to the open state, rejecting all calls.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            self.trip_open(&mut inner);
        } else {
            // Restart the timeout window.
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Manually forces the circuit to the closed state, allowing all calls.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.close(&mut inner);
        }
    }

    /// Resets the circuit breaker to its initial closed state, clearing all
    /// counters, history, and the last recorded error.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerInner::new();
    }

    /// Returns current statistics about this circuit breaker.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        CircuitBreakerStats {
            key: self.key.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            timeout: self.config.timeout,
            open_duration: inner.opened_at.map(|at| at.elapsed()),
            recent_success_rate: inner.recent_success_rate(),
            last_error: inner.last_error.clone(),
        }
    }

    /// Gate for one call. On `Ok`, the caller owns an admission that must be
    /// settled with the outcome.
    fn try_acquire(&self) -> Result<Admission<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(Admission {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_requests {
                    inner.half_open_in_flight += 1;
                    Ok(Admission {
                        breaker: self,
                        trial: true,
                        settled: false,
                    })
                } else {
                    Err(self.open_error(&inner))
                }
            }
            CircuitState::Open => Err(self.open_error(&inner)),
        }
    }

    /// Time-driven open-to-half-open transition. Called under the lock by
    /// every observer so the transition is visible exactly once.
    fn advance(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let timed_out = inner
                .opened_at
                .map_or(true, |at| at.elapsed() >= self.config.timeout);
            if timed_out {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_in_flight = 0;
                inner.consecutive_successes = 0;
                tracing::info!(circuit = %self.key, "circuit breaker half-open");
                self.publish(ResilienceEvent::CircuitHalfOpen {
                    key: self.key.clone(),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    fn settle(&self, trial: bool, success: bool, error: Option<&str>) {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.push_outcome(success);

        if success {
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_successes += 1;
                    inner.consecutive_failures = 0;
                }
                CircuitState::HalfOpen => {
                    if trial {
                        inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                    }
                    inner.consecutive_successes += 1;
                    inner.consecutive_failures = 0;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        self.close(&mut inner);
                    }
                }
                CircuitState::Open => {
                    tracing::warn!(circuit = %self.key, "success recorded while circuit is open");
                }
            }
        } else {
            inner.last_error = error.map(String::from);
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    inner.consecutive_successes = 0;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        self.trip_open(&mut inner);
                    }
                }
                CircuitState::HalfOpen => {
                    // Any half-open failure reopens immediately; the timeout restarts.
                    inner.consecutive_failures += 1;
                    inner.consecutive_successes = 0;
                    self.trip_open(&mut inner);
                }
                CircuitState::Open => {
                    inner.consecutive_failures += 1;
                }
            }
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn trip_open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_in_flight = 0;
        inner.consecutive_successes = 0;

        tracing::warn!(
            circuit = %self.key,
            failures = inner.consecutive_failures,
            "circuit breaker opened"
        );
        self.publish(ResilienceEvent::CircuitOpened {
            key: self.key.clone(),
            consecutive_failures: inner.consecutive_failures,
            timestamp: Utc::now(),
        });
    }

    fn close(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;

        tracing::info!(circuit = %self.key, "circuit breaker closed");
        self.publish(ResilienceEvent::CircuitClosed {
            key: self.key.clone(),
            timestamp: Utc::now(),
        });
    }

    fn open_error(&self, inner: &BreakerInner) -> CircuitOpenError {
        CircuitOpenError {
            key: self.key.clone(),
            open_duration: inner.opened_at.map(|at| at.elapsed()).unwrap_or_default(),
            failure_count: inner.consecutive_failures,
            last_error: inner.last_error.clone(),
        }
    }

    fn publish(&self, event: ResilienceEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

/// Statistics about a circuit breaker's current state.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Key of the circuit breaker.
    pub key: String,
    /// Current state of the circuit.
    pub state: CircuitState,
    /// Current consecutive failure count.
    pub consecutive_failures: u32,
    /// Current consecutive success count.
    pub consecutive_successes: u32,
    /// Configured failure threshold to open the circuit.
    pub failure_threshold: u32,
    /// Configured success threshold to close the circuit.
    pub success_threshold: u32,
    /// Configured timeout before the open to half-open transition.
    pub timeout: Duration,
    /// Duration the circuit has been open, if currently open.
    pub open_duration: Option<Duration>,
    /// Success fraction over the bounded outcome history (1.0 when empty).
    pub recent_success_rate: f64,
    /// Last error message that triggered a failure, if any.
    pub last_error: Option<String>,
}

impl std::fmt::Display for CircuitBreakerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CircuitBreaker[{}]: state={}, failures={}/{}, successes={}/{}",
            self.key,
            self.state,
            self.consecutive_failures,
            self.failure_threshold,
            self.consecutive_successes,
            self.success_threshold
        )?;
        if let Some(duration) = self.open_duration {
            write!(f, ", open_for={:?}", duration)?;
        }
        Ok(())
    }
}

/// A keyed registry of circuit breakers with an aggregate health score.
///
/// Owns every breaker for the process lifetime; breakers are created on
/// first use and only ever reset, never destroyed.
#[derive(Debug, Default)]
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
    events: Option<EventBus>,
}

impl CircuitBreakerManager {
    /// Creates a new empty manager with default breaker configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration applied to breakers created without one.
    #[must_use]
    pub fn with_default_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.default_config = config;
        self
    }

    /// Attaches an event bus propagated to every breaker created afterwards.
    #[must_use]
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Returns an existing circuit breaker by key, or creates one with the
    /// manager's default configuration.
    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with_config(key, self.default_config.clone())
    }

    /// Returns an existing circuit breaker by key, or creates one with the
    /// given configuration.
    ///
    /// Idempotent: a second call with the same key returns the existing
    /// breaker and ignores the config argument.
    pub fn get_or_create_with_config(
        &self,
        key: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(key) {
            return Arc::clone(breaker);
        }

        let mut guard = self.breakers.write();
        if let Some(breaker) = guard.get(key) {
            return Arc::clone(breaker);
        }

        let mut breaker = CircuitBreaker::with_config(key, config);
        if let Some(events) = &self.events {
            breaker = breaker.with_event_bus(events.clone());
        }
        let breaker = Arc::new(breaker);
        guard.insert(key.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Returns an existing circuit breaker by key, if it exists.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(key).map(Arc::clone)
    }

    /// Executes an operation through the breaker for `key`, creating the
    /// breaker on first use.
    pub async fn execute<T, E, F, Fut>(&self, key: &str, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let breaker = self.get_or_create(key);
        breaker.execute(f).await
    }

    /// Returns statistics for all registered circuit breakers.
    #[must_use]
    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<_> = self.breakers.read().values().map(Arc::clone).collect();
        breakers.iter().map(|b| b.stats()).collect()
    }

    /// Returns the keys of all currently open circuit breakers.
    #[must_use]
    pub fn open_circuits(&self) -> Vec<String> {
        let breakers: Vec<_> = self.breakers.read().values().map(Arc::clone).collect();
        breakers
            .iter()
            .filter(|b| b.state() == CircuitState::Open)
            .map(|b| b.key().to_string())
            .collect()
    }

    /// Resets all registered circuit breakers to their initial closed state.
    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.read().values().map(Arc::clone).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Aggregate 0-100 health score across all breakers.
    ///
    /// Each breaker contributes the mean of a state score (closed 100,
    /// half-open 50, open 0) and its recent success rate, so a breaker with
    /// a rocky history drags the score down before it trips. An empty
    /// registry scores 100.
    #[must_use]
    pub fn overall_health(&self) -> f64 {
        let breakers: Vec<_> = self.breakers.read().values().map(Arc::clone).collect();
        if breakers.is_empty() {
            return 100.0;
        }

        let total: f64 = breakers
            .iter()
            .map(|b| {
                let stats = b.stats();
                let state_score = match stats.state {
                    CircuitState::Closed => 100.0,
                    CircuitState::HalfOpen => 50.0,
                    CircuitState::Open => 0.0,
                };
                (state_score + stats.recent_success_rate * 100.0) / 2.0
            })
            .sum();

        total / breakers.len() as f64
    }

    /// Number of registered breakers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Returns `true` if no breakers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_success_threshold(2)
            .with_timeout(Duration::from_millis(50))
            .with_half_open_requests(2)
    }

    #[test]
    fn test_initial_state() {
        let breaker = CircuitBreaker::new("test");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.success_count(), 0);
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::with_config("test", fast_config());

        breaker.record_failure(Some("error 1"));
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure(Some("error 2"));
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure(Some("error 3"));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
        assert_eq!(breaker.last_error().as_deref(), Some("error 3"));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::with_config("test", fast_config());

        breaker.record_failure(Some("error"));
        breaker.record_failure(Some("error"));
        assert_eq!(breaker.failure_count(), 2);

        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking_operation() {
        let breaker = CircuitBreaker::with_config("test", fast_config());
        let invocations = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = breaker
                .execute(|| async {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Err::<(), String>("boom".to_string())
                })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(invocations.load(Ordering::SeqCst), 3);

        let result = breaker
            .execute(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            })
            .await;

        assert!(matches!(result, Err(e) if e.is_circuit_open()));
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_half_open_after_timeout_and_reopen_on_failure() {
        let breaker = CircuitBreaker::with_config("test", fast_config());

        for _ in 0..3 {
            breaker.record_failure(Some("boom"));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Any half-open failure reopens and restarts the timeout.
        let result = breaker
            .execute(|| async { Err::<(), String>("still down".to_string()) })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Inner(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.remaining_open_time().is_some());
    }

    #[tokio::test]
    async fn test_closes_after_success_threshold_and_resets_counters() {
        let breaker = CircuitBreaker::with_config("test", fast_config());

        for _ in 0..3 {
            breaker.record_failure(Some("boom"));
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        for _ in 0..2 {
            let result = breaker.execute(|| async { Ok::<(), String>(()) }).await;
            assert!(result.is_ok());
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.success_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_concurrency_cap() {
        let breaker = Arc::new(CircuitBreaker::with_config("test", fast_config()));

        for _ in 0..3 {
            breaker.record_failure(Some("boom"));
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Two slow trials occupy both half-open slots.
        let mut handles = Vec::new();
        for _ in 0..2 {
            let b = Arc::clone(&breaker);
            handles.push(tokio::spawn(async move {
                b.execute(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<(), String>(())
                })
                .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = breaker.execute(|| async { Ok::<(), String>(()) }).await;
        assert!(matches!(result, Err(e) if e.is_circuit_open()));

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_force_open_and_close() {
        let breaker = CircuitBreaker::new("test");

        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.force_close();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset() {
        let breaker =
            CircuitBreaker::with_config("test", fast_config().with_failure_threshold(1));

        breaker.record_failure(Some("error"));
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.last_error().is_none());
    }

    #[test]
    fn test_manager_get_or_create_idempotent() {
        let manager = CircuitBreakerManager::new();

        let breaker1 = manager.get_or_create_with_config(
            "api",
            CircuitBreakerConfig::new().with_failure_threshold(2),
        );
        let breaker2 = manager.get_or_create_with_config(
            "api",
            CircuitBreakerConfig::new().with_failure_threshold(9),
        );

        assert!(Arc::ptr_eq(&breaker1, &breaker2));
        // First config wins.
        assert_eq!(breaker2.config().failure_threshold, 2);
    }

    #[test]
    fn test_manager_overall_health_empty_is_100() {
        let manager = CircuitBreakerManager::new();
        assert!((manager.overall_health() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_manager_overall_health_drops_with_open_breaker() {
        let manager =
            CircuitBreakerManager::new().with_default_config(fast_config());

        let healthy = manager.get_or_create("healthy");
        healthy.record_success();

        let broken = manager.get_or_create("broken");
        for _ in 0..3 {
            broken.record_failure(Some("down"));
        }

        assert_eq!(manager.open_circuits(), vec!["broken".to_string()]);
        let health = manager.overall_health();
        assert!(health < 100.0);
        assert!(health > 0.0);
    }

    #[test]
    fn test_breakers_are_independent() {
        let manager = CircuitBreakerManager::new().with_default_config(fast_config());

        let a = manager.get_or_create("dep-a");
        for _ in 0..3 {
            a.record_failure(Some("down"));
        }
        assert_eq!(a.state(), CircuitState::Open);

        let b = manager.get_or_create("dep-b");
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.can_execute());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }

    #[tokio::test]
    async fn test_events_emitted_on_transitions() {
        let bus = EventBus::default();
        let mut stream = bus.subscribe();
        let breaker =
            CircuitBreaker::with_config("api", fast_config()).with_event_bus(bus);

        for _ in 0..3 {
            breaker.record_failure(Some("down"));
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = breaker.state();
        breaker.record_success();
        breaker.record_success();

        let types: Vec<&'static str> = stream.drain().iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec!["circuit-opened", "circuit-half-open", "circuit-closed"]
        );
    }
}
