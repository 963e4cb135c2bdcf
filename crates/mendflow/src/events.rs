// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Typed event stream for the resilience core.
//!
//! Every protective reaction in the core (breaker trips, failure detection,
//! recovery outcomes, degradation transitions) is published as a
//! [`ResilienceEvent`] on a shared [`EventBus`]. Operators and the
//! chaos-injection harness subscribe to this stream to observe behavior
//! without polling component state.
//!
//! ## Delivery Semantics
//!
//! The bus is backed by a `tokio::sync::broadcast` channel: every event is
//! delivered at least once to each live subscriber, with no ordering
//! guarantee across subscribers. A subscriber that falls more than the
//! channel capacity behind skips the missed events and continues from the
//! oldest retained one.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mendflow::events::EventBus;
//!
//! let bus = EventBus::default();
//! let mut stream = bus.subscribe();
//!
//! tokio::spawn(async move {
//!     while let Some(event) = stream.recv().await {
//!         println!("{}: {:?}", event.event_type(), event);
//!     }
//! });
//! ```

use crate::constants::DEFAULT_EVENT_CAPACITY;
use crate::degradation::DegradationLevel;
use crate::healer::{FailureCategory, FailureSeverity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// An event emitted by the resilience core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ResilienceEvent {
    /// A circuit breaker tripped open.
    CircuitOpened {
        /// Breaker key.
        key: String,
        /// Consecutive failures at the moment the breaker tripped.
        consecutive_failures: u32,
        /// When the transition happened.
        timestamp: DateTime<Utc>,
    },
    /// A circuit breaker closed after successful half-open trials.
    CircuitClosed {
        /// Breaker key.
        key: String,
        /// When the transition happened.
        timestamp: DateTime<Utc>,
    },
    /// An open circuit breaker began admitting half-open trials.
    CircuitHalfOpen {
        /// Breaker key.
        key: String,
        /// When the transition happened.
        timestamp: DateTime<Utc>,
    },
    /// A failure was reported to the self-healer.
    FailureDetected {
        /// Failure record id.
        id: Uuid,
        /// Failure category.
        category: FailureCategory,
        /// Dependency or component the failure originated from.
        source_id: String,
        /// Reported severity.
        severity: FailureSeverity,
        /// When the failure was detected.
        timestamp: DateTime<Utc>,
    },
    /// A recovery reached a successful terminal state.
    RecoverySucceeded {
        /// Failure record id.
        id: Uuid,
        /// Source the recovery targeted.
        source_id: String,
        /// Attempts consumed, including the successful one.
        attempts: u32,
        /// Total recovery duration in milliseconds.
        duration_ms: u64,
        /// When recovery completed.
        timestamp: DateTime<Utc>,
    },
    /// A recovery exhausted its strategy and was marked failed.
    RecoveryFailed {
        /// Failure record id.
        id: Uuid,
        /// Source the recovery targeted.
        source_id: String,
        /// Attempts consumed.
        attempts: u32,
        /// Last error observed before giving up.
        error: String,
        /// When recovery gave up.
        timestamp: DateTime<Utc>,
    },
    /// A recovery was exhausted and escalated to operators.
    EscalationTriggered {
        /// Failure record id.
        id: Uuid,
        /// Source the recovery targeted.
        source_id: String,
        /// Last error observed before escalating.
        error: String,
        /// When the escalation was raised.
        timestamp: DateTime<Utc>,
    },
    /// The degradation level moved to a more severe state.
    DegradationActivated {
        /// New degradation level.
        level: DegradationLevel,
        /// Features newly disabled by this transition.
        disabled: Vec<String>,
        /// Why the transition happened.
        reason: String,
        /// When the transition happened.
        timestamp: DateTime<Utc>,
    },
    /// The degradation level moved to a less severe state.
    DegradationRecovered {
        /// New degradation level.
        level: DegradationLevel,
        /// Features re-enabled by this transition, in re-enable order.
        reenabled: Vec<String>,
        /// Why the transition happened.
        reason: String,
        /// When the transition happened.
        timestamp: DateTime<Utc>,
    },
}

impl ResilienceEvent {
    /// Get the wire name of this event kind.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CircuitOpened { .. } => "circuit-opened",
            Self::CircuitClosed { .. } => "circuit-closed",
            Self::CircuitHalfOpen { .. } => "circuit-half-open",
            Self::FailureDetected { .. } => "failure-detected",
            Self::RecoverySucceeded { .. } => "recovery-succeeded",
            Self::RecoveryFailed { .. } => "recovery-failed",
            Self::EscalationTriggered { .. } => "escalation-triggered",
            Self::DegradationActivated { .. } => "degradation-activated",
            Self::DegradationRecovered { .. } => "degradation-recovered",
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::CircuitOpened { timestamp, .. } => *timestamp,
            Self::CircuitClosed { timestamp, .. } => *timestamp,
            Self::CircuitHalfOpen { timestamp, .. } => *timestamp,
            Self::FailureDetected { timestamp, .. } => *timestamp,
            Self::RecoverySucceeded { timestamp, .. } => *timestamp,
            Self::RecoveryFailed { timestamp, .. } => *timestamp,
            Self::EscalationTriggered { timestamp, .. } => *timestamp,
            Self::DegradationActivated { timestamp, .. } => *timestamp,
            Self::DegradationRecovered { timestamp, .. } => *timestamp,
        }
    }
}

/// Shared publisher for [`ResilienceEvent`]s.
///
/// Cloning the bus is cheap; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ResilienceEvent>,
}

impl EventBus {
    /// Create a bus with a custom per-subscriber buffer capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all subscribers.
    ///
    /// Publishing never fails: with no live subscribers the event is
    /// dropped after being logged.
    pub fn emit(&self, event: ResilienceEvent) {
        tracing::debug!(event = event.event_type(), "resilience event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to the event stream from this point forward.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

/// A subscription to the resilience event stream.
#[derive(Debug)]
pub struct EventStream {
    receiver: broadcast::Receiver<ResilienceEvent>,
}

impl EventStream {
    /// Receive the next event, waiting if none is buffered.
    ///
    /// Returns `None` once the bus is dropped. A lagged subscriber skips
    /// the missed events and keeps receiving.
    pub async fn recv(&mut self) -> Option<ResilienceEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged; skipping ahead");
                    continue;
                }
            }
        }
    }

    /// Try to receive the next event without waiting.
    pub fn try_recv(&mut self) -> Option<ResilienceEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain every event currently buffered.
    pub fn drain(&mut self) -> Vec<ResilienceEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let event = ResilienceEvent::CircuitOpened {
            key: "db".to_string(),
            consecutive_failures: 5,
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type(), "circuit-opened");

        let event = ResilienceEvent::DegradationActivated {
            level: DegradationLevel::Minimal,
            disabled: vec!["advanced-analytics".to_string()],
            reason: "health below threshold".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type(), "degradation-activated");
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.emit(ResilienceEvent::CircuitClosed {
            key: "api".to_string(),
            timestamp: Utc::now(),
        });
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let bus = EventBus::default();
        let mut stream = bus.subscribe();

        bus.emit(ResilienceEvent::CircuitHalfOpen {
            key: "api".to_string(),
            timestamp: Utc::now(),
        });

        let event = stream.recv().await.expect("event");
        assert_eq!(event.event_type(), "circuit-half-open");
    }

    #[tokio::test]
    async fn test_drain_collects_buffered_events() {
        let bus = EventBus::default();
        let mut stream = bus.subscribe();

        for _ in 0..3 {
            bus.emit(ResilienceEvent::CircuitClosed {
                key: "api".to_string(),
                timestamp: Utc::now(),
            });
        }

        assert_eq!(stream.drain().len(), 3);
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_event_serialization_round_trip() {
        let event = ResilienceEvent::FailureDetected {
            id: Uuid::new_v4(),
            category: FailureCategory::Network,
            source_id: "payments-api".to_string(),
            severity: FailureSeverity::High,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("failure-detected"));
        let back: ResilienceEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.event_type(), "failure-detected");
    }
}
