// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Harvest event bus: typed events from the session manager and orchestrator.
//!
//! The EventBus is a `tokio::sync::broadcast` channel that carries
//! [`HarvestEvent`] values. Any consumer (CLI progress output, JSON log
//! streaming, tests) can subscribe independently. When no subscribers
//! exist, events are silently dropped.

use crate::error::FailureKind;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why a session was torn down and relaunched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationReason {
    /// The configured number of items was completed on this session.
    Interval,
    /// Liveness probe failed or the session grew too old.
    Unhealthy,
    /// Too many consecutive item failures.
    CircuitBreaker,
    /// Repeated connection-class errors while retrying one item.
    Retry,
}

/// Every event the harvester emits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HarvestEvent {
    // ── Run Events ────────────────────────
    RunStarted { tasks: usize, timestamp: String },
    RunFinished {
        succeeded: usize,
        failed: usize,
        elapsed_ms: u64,
    },

    // ── Session Events ────────────────────
    SessionOpened { session_id: String, user_agent: String },
    SessionClosed { session_id: String },
    SessionRotated { reason: RotationReason },
    StateCleared { session_id: String },

    // ── Resilience Events ─────────────────
    /// Consecutive failures crossed the threshold; a cooldown follows.
    CircuitOpened {
        consecutive_failures: u32,
        cooldown_secs: u64,
    },
    HealthChecked {
        healthy: bool,
        memory_pct: Option<f64>,
        disk_pct: Option<f64>,
        constrained: bool,
    },
    AttemptFailed {
        entity_id: String,
        attempt: u32,
        kind: FailureKind,
        recovery: String,
    },

    // ── Work Events ───────────────────────
    FormSubmitted {
        entity_id: String,
        period_start: String,
        period_end: String,
        attempt: u32,
    },
    TaskCompleted {
        entity_id: String,
        date: String,
        outcome: String,
    },
    TaskFailed {
        entity_id: String,
        date: String,
        kind: FailureKind,
    },
}

/// The central event bus.
pub struct EventBus {
    sender: broadcast::Sender<HarvestEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: HarvestEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<HarvestEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Drain every event currently buffered in a receiver.
pub fn drain(rx: &mut broadcast::Receiver<HarvestEvent>) -> Vec<HarvestEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = HarvestEvent::SessionRotated {
            reason: RotationReason::CircuitBreaker,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("SessionRotated"));
        assert!(json.contains("circuit_breaker"));

        let parsed: HarvestEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            HarvestEvent::SessionRotated { reason } => {
                assert_eq!(reason, RotationReason::CircuitBreaker)
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_event_bus_emit_no_subscribers() {
        let bus = EventBus::new(16);
        bus.emit(HarvestEvent::RunStarted {
            tasks: 3,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        });
    }

    #[test]
    fn test_event_bus_drain_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(HarvestEvent::CircuitOpened {
            consecutive_failures: 3,
            cooldown_secs: 60,
        });
        bus.emit(HarvestEvent::SessionRotated {
            reason: RotationReason::CircuitBreaker,
        });

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], HarvestEvent::CircuitOpened { .. }));
        assert!(matches!(events[1], HarvestEvent::SessionRotated { .. }));
        assert!(drain(&mut rx).is_empty());
    }
}
