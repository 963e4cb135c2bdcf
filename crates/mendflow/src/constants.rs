// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Centralized defaults for the resilience core.
//!
//! Every tunable in this crate has its default defined here so that the
//! breaker, healer, monitor, and degradation modules stay consistent and a
//! reader can audit the whole configuration surface in one place.

use std::time::Duration;

/// Consecutive failures required to trip a breaker open.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Consecutive half-open successes required to close a breaker.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

/// Time an open breaker waits before admitting half-open trials.
pub const DEFAULT_BREAKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Concurrent trial calls admitted while a breaker is half-open.
pub const DEFAULT_HALF_OPEN_REQUESTS: u32 = 3;

/// Outcomes retained per breaker for failure-rate weighting.
pub const BREAKER_HISTORY_CAP: usize = 64;

/// Recoveries allowed in flight at once.
pub const DEFAULT_MAX_CONCURRENT_RECOVERIES: usize = 5;

/// Wall-clock bound on a single recovery attempt.
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry attempts before a retry strategy is exhausted.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay before the second retry attempt.
pub const DEFAULT_INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Cap on the exponential retry delay.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff multiplier between retry attempts.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Terminal failure records retained for statistics before rotation.
pub const DEFAULT_MAX_RETAINED_RECORDS: usize = 1000;

/// Sleep granularity while a recovery defers on an open breaker.
pub const BREAKER_DEFER_POLL: Duration = Duration::from_millis(25);

/// Interval between health monitor polls.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Health samples retained for trend reporting.
pub const HEALTH_HISTORY_CAP: usize = 120;

/// Score at or below which the system enters REDUCED degradation.
pub const DEFAULT_REDUCED_THRESHOLD: f64 = 80.0;

/// Score at or below which the system enters MINIMAL degradation.
pub const DEFAULT_MINIMAL_THRESHOLD: f64 = 60.0;

/// Score at or below which the system enters EMERGENCY degradation.
pub const DEFAULT_EMERGENCY_THRESHOLD: f64 = 40.0;

/// Interval between degradation recovery checks.
pub const DEFAULT_RECOVERY_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Buffered events per subscriber before lagging subscribers skip ahead.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
