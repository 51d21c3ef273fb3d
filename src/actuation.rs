//! ==============================================================================
//! actuation.rs - Actuation & Audit Sink
//! ==============================================================================
//!
//! purpose:
//!     carries one decision out into the world:
//!
//! ```text
//!         ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!         │ relay write  │   │ audit append │   │ publish      │
//!         └──────────────┘   └──────────────┘   └──────────────┘
//!
//!     the three steps are independent. a failure in one is logged and
//!     neither blocks nor undoes the others. the relay write is idempotent,
//!     so the next cycle simply commands it again.
//! ```
//!
//! ==============================================================================

use crate::domain::{EdgeDecision, Environment, RelayState};
use crate::hal::RelayDriver;
use crate::messaging::{DecisionMessage, MessageBus};
use crate::store::Store;
use std::sync::Arc;

/// What happened to each step of one `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub actuated: bool,
    pub audited: bool,
    /// `None` when no publisher is configured
    pub published: Option<bool>,
}

pub struct Publisher {
    pub bus: Arc<dyn MessageBus>,
    pub topic: String,
}

pub struct ActuationSink {
    relay: Box<dyn RelayDriver>,
    audit: Arc<dyn Store>,
    publisher: Option<Publisher>,
}

impl ActuationSink {
    pub fn new(relay: Box<dyn RelayDriver>, audit: Arc<dyn Store>, publisher: Option<Publisher>) -> Self {
        Self { relay, audit, publisher }
    }

    pub fn apply(&mut self, decision: &EdgeDecision, env: &Environment) -> ApplyReport {
        let actuated = match self.relay.set_state(decision.relay_pin, decision.relay_state) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("[RELAY] {}", e);
                false
            }
        };

        let audited = match self.audit.record_decision(decision) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("[AUDIT] failed to record decision for tier '{}': {}", decision.tier, e);
                false
            }
        };

        let published = self.publisher.as_ref().map(|p| {
            let result = DecisionMessage::new(decision, env)
                .to_bytes()
                .and_then(|bytes| p.bus.publish(&p.topic, &bytes));
            match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("[PUBLISH] {}", e);
                    false
                }
            }
        });

        ApplyReport { actuated, audited, published }
    }

    /// Best-effort OFF on every pin. Used at startup and shutdown.
    pub fn all_off(&mut self, pins: &[u8]) {
        for &pin in pins {
            match self.relay.set_state(pin, RelayState::Off) {
                Ok(()) => tracing::info!("[RELAY] pin {} OFF", pin),
                Err(e) => tracing::error!("[RELAY] could not switch pin {} off: {}", pin, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DetectionState;
    use crate::hal::RecordingRelay;
    use crate::messaging::LocalBus;
    use crate::store::{AuditStore, MemoryStore};

    fn decision(state: RelayState) -> EdgeDecision {
        EdgeDecision {
            timestamp: 1_700_000_000,
            tier: "filter".into(),
            relay_pin: 19,
            reading_value: 13.0,
            baseline_value: 10.0,
            threshold_ratio: 0.25,
            relay_state: state,
            detection_state: if state.is_on() {
                DetectionState::AboveThreshold
            } else {
                DetectionState::BelowThreshold
            },
            window_size_used: 20,
            window_valid: true,
            override_applied: None,
        }
    }

    #[test]
    fn applying_twice_leaves_the_same_relay_state() {
        let relay = RecordingRelay::new();
        let store = Arc::new(MemoryStore::new());
        let mut sink = ActuationSink::new(Box::new(relay.clone()), store.clone(), None);

        let on = decision(RelayState::On);
        let first = sink.apply(&on, &Environment::default());
        let second = sink.apply(&on, &Environment::default());

        assert_eq!(first, second);
        assert_eq!(first, ApplyReport { actuated: true, audited: true, published: None });
        assert_eq!(relay.state(19), Some(RelayState::On));
        assert_eq!(store.recent_decisions(10).unwrap().len(), 2);
    }

    #[test]
    fn relay_failure_does_not_block_audit_or_publish() {
        let relay = RecordingRelay::new();
        relay.set_failing(true);
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(LocalBus::new());
        let publisher = Publisher { bus: bus.clone(), topic: "pm25/decisions".into() };
        let mut sink = ActuationSink::new(Box::new(relay.clone()), store.clone(), Some(publisher));

        let report = sink.apply(&decision(RelayState::On), &Environment::default());

        assert_eq!(report, ApplyReport { actuated: false, audited: true, published: Some(true) });
        assert_eq!(relay.state(19), None);
        assert_eq!(store.recent_decisions(1).unwrap()[0].relay_state, RelayState::On);
        assert_eq!(bus.published()[0].0, "pm25/decisions");
    }

    #[test]
    fn all_off_commands_every_pin() {
        let relay = RecordingRelay::new();
        let mut sink = ActuationSink::new(Box::new(relay.clone()), Arc::new(MemoryStore::new()), None);
        sink.all_off(&[19, 26]);
        assert_eq!(relay.commands(), vec![(19, RelayState::Off), (26, RelayState::Off)]);
    }
}
