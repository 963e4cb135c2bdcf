// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Unified error type for the resilience core.
//!
//! This module provides a single error type covering the healer, monitor,
//! and degradation surfaces. Circuit breakers carry their own
//! [`CircuitBreakerError`](crate::circuit_breaker::CircuitBreakerError) so
//! callers can statically distinguish a control rejection (circuit open, no
//! side effect occurred) from the wrapped operation's own failure.

use crate::healer::FailureStatus;
use thiserror::Error;
use uuid::Uuid;

/// Unified error type for resilience operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ResilienceError {
    /// No failure record exists with the given id.
    #[error("Failure record not found: {0}")]
    RecordNotFound(Uuid),

    /// A record was asked to heal while not in the queued state.
    #[error("Failure record {id} is {status}, not queued")]
    RecordNotQueued {
        /// Record id.
        id: Uuid,
        /// Status the record was found in.
        status: FailureStatus,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operation exceeded its deadline.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The component has been shut down and no longer accepts work.
    #[error("Component is shut down: {0}")]
    ShutDown(String),

    /// Generic error for other cases.
    #[error("{0}")]
    Other(String),
}

impl ResilienceError {
    /// Create an invalid-configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Create a shut-down error.
    #[must_use]
    pub fn shut_down(message: impl Into<String>) -> Self {
        Self::ShutDown(message.into())
    }

    /// Create a generic "other" error.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Check if this is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RecordNotFound(_))
    }

    /// Check if this is a timeout error.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Convenience type alias for Results with ResilienceError.
pub type Result<T> = std::result::Result<T, ResilienceError>;

impl From<String> for ResilienceError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}

impl From<&str> for ResilienceError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}
