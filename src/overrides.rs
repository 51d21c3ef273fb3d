//! Operator overrides: emergency stop and manual ON.
//!
//! Emergency stop latches until an explicit resume and wins over manual ON.
//! Manual ON expires on its own after the configured duration. The detector
//! still runs underneath; an override only replaces the commanded relay state
//! and is stamped into the decision record.

use crate::domain::{ControlOverride, EdgeDecision};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Latches {
    emergency: bool,
    manual_until: Option<i64>,
}

#[derive(Clone)]
pub struct OverrideState {
    latches: Arc<Mutex<Latches>>,
    manual_duration_secs: i64,
}

impl OverrideState {
    pub fn new(manual_duration_secs: u64) -> Self {
        Self {
            latches: Arc::new(Mutex::new(Latches::default())),
            manual_duration_secs: i64::try_from(manual_duration_secs).unwrap_or(i64::MAX),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Latches) -> R) -> R {
        // poisoned latch data is still plain bools; keep using it
        let mut guard = match self.latches.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn emergency_stop(&self) {
        tracing::warn!("[OVERRIDE] EMERGENCY STOP - all relays latched OFF");
        self.with(|l| l.emergency = true);
    }

    pub fn resume(&self) {
        tracing::info!("[OVERRIDE] emergency stop released");
        self.with(|l| l.emergency = false);
    }

    pub fn manual_on(&self, now: i64) {
        let until = now.saturating_add(self.manual_duration_secs);
        tracing::info!("[OVERRIDE] manual ON until {}", until);
        self.with(|l| l.manual_until = Some(until));
    }

    pub fn clear_manual(&self) {
        tracing::info!("[OVERRIDE] manual override cleared");
        self.with(|l| l.manual_until = None);
    }

    pub fn active(&self, now: i64) -> Option<ControlOverride> {
        self.with(|l| {
            if l.emergency {
                Some(ControlOverride::EmergencyStop)
            } else if l.manual_until.is_some_and(|until| now < until) {
                Some(ControlOverride::ManualOn)
            } else {
                None
            }
        })
    }

    /// Replaces the commanded state when an override is active.
    pub fn apply(&self, decision: &mut EdgeDecision, now: i64) {
        if let Some(o) = self.active(now) {
            decision.relay_state = o.forced_state();
            decision.override_applied = Some(o);
        }
    }

    /// `STOP` / `RESUME` on the emergency topic
    pub fn handle_emergency_message(&self, payload: &[u8]) {
        match String::from_utf8_lossy(payload).trim().to_ascii_uppercase().as_str() {
            "STOP" => self.emergency_stop(),
            "RESUME" => self.resume(),
            other => tracing::warn!("[OVERRIDE] unknown emergency command '{}'", other),
        }
    }

    /// `ON` / `OFF` on the user override topic
    pub fn handle_override_message(&self, payload: &[u8], now: i64) {
        match String::from_utf8_lossy(payload).trim().to_ascii_uppercase().as_str() {
            "ON" => self.manual_on(now),
            "OFF" => self.clear_manual(),
            other => tracing::warn!("[OVERRIDE] unknown override command '{}'", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DetectionState, RelayState};

    fn below(now: i64) -> EdgeDecision {
        EdgeDecision {
            timestamp: now,
            tier: "filter".into(),
            relay_pin: 19,
            reading_value: 6.0,
            baseline_value: 7.5,
            threshold_ratio: 0.5,
            relay_state: RelayState::Off,
            detection_state: DetectionState::BelowThreshold,
            window_size_used: 20,
            window_valid: true,
            override_applied: None,
        }
    }

    #[test]
    fn manual_on_expires() {
        let o = OverrideState::new(1800);
        o.manual_on(1_000);
        assert_eq!(o.active(2_799), Some(ControlOverride::ManualOn));
        assert_eq!(o.active(2_800), None);
    }

    #[test]
    fn emergency_wins_and_latches() {
        let o = OverrideState::new(1800);
        o.handle_override_message(b"ON", 0);
        o.handle_emergency_message(b"STOP");
        assert_eq!(o.active(10), Some(ControlOverride::EmergencyStop));
        assert_eq!(o.active(1_000_000), Some(ControlOverride::EmergencyStop));
        o.handle_emergency_message(b"resume\n");
        assert_eq!(o.active(10), Some(ControlOverride::ManualOn));
    }

    #[test]
    fn apply_keeps_detector_verdict() {
        let o = OverrideState::new(60);
        o.manual_on(100);
        let mut d = below(110);
        o.apply(&mut d, 110);
        assert_eq!(d.relay_state, RelayState::On);
        assert_eq!(d.detection_state, DetectionState::BelowThreshold);
        assert_eq!(d.override_applied, Some(ControlOverride::ManualOn));
        assert_eq!(d.detected_state(), RelayState::Off);
    }

    #[test]
    fn no_override_leaves_decision_alone() {
        let o = OverrideState::new(60);
        o.handle_emergency_message(b"garbage");
        let mut d = below(5);
        o.apply(&mut d, 5);
        assert_eq!(d, below(5));
    }
}
