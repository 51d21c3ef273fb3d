//! ==============================================================================
//! detector.rs - rising-edge decision engine
//! ==============================================================================
//!
//! purpose:
//!     decides, per threshold tier, whether the recent window of readings is a
//!     sustained excursion above the baseline. pure: no i/o, no clock access,
//!     the caller supplies `now`.
//!
//! rules:
//!     - the window is usable only when it holds `window_size` readings and
//!       every one of them is younger than `recency_limit_seconds`.
//!     - an unusable window turns every tier OFF (INSUFFICIENT_DATA).
//!     - a tier is ON only if EVERY reading is strictly above
//!       `baseline * (1 + ratio)`. one sample at or under the line is OFF.
//!
//! ==============================================================================

use crate::domain::{DetectionState, EdgeDecision, Reading, RelayState};
use chrono::NaiveTime;
use serde::Deserialize;

/// ratio override that applies once the baseline reaches `min_baseline`
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct RatioBand {
    pub min_baseline: f64,
    pub ratio: f64,
}

/// one independently evaluated (ratio, relay) pair
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ThresholdTier {
    pub name: String,
    pub relay_pin: u8,
    /// fractional excess over baseline, used below every band
    pub ratio: f64,
    #[serde(default)]
    pub bands: Vec<RatioBand>,
}

impl ThresholdTier {
    /// Margin for a given baseline: the band with the highest `min_baseline`
    /// the baseline reaches, else the tier's own ratio.
    pub fn ratio_for(&self, baseline: f64) -> f64 {
        self.bands
            .iter()
            .filter(|b| baseline >= b.min_baseline)
            .max_by(|a, b| a.min_baseline.total_cmp(&b.min_baseline))
            .map(|b| b.ratio)
            .unwrap_or(self.ratio)
    }
}

/// local time-of-day interval `[start, end)` with no detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlackoutWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl BlackoutWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// parses "HH:MM" bounds
    pub fn parse(start: &str, end: &str) -> Result<Self, String> {
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| format!("'{s}': {e}"))
        };
        let (start, end) = (parse(start)?, parse(end)?);
        if start == end {
            return Err("start and end must differ".to_string());
        }
        Ok(Self { start, end })
    }

    /// wraps past midnight when `end < start` (e.g. 23:00-01:00)
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start < self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

#[derive(Debug, Clone)]
pub struct EdgeDetector {
    tiers: Vec<ThresholdTier>,
    window_size: usize,
    recency_limit_seconds: i64,
}

impl EdgeDetector {
    pub fn new(tiers: Vec<ThresholdTier>, window_size: usize, recency_limit_seconds: u64) -> Self {
        Self {
            tiers,
            window_size,
            recency_limit_seconds: i64::try_from(recency_limit_seconds).unwrap_or(i64::MAX),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn tiers(&self) -> &[ThresholdTier] {
        &self.tiers
    }

    /// full and fresh
    pub fn window_valid(&self, window: &[Reading], now: i64) -> bool {
        let oldest_allowed = now.saturating_sub(self.recency_limit_seconds);
        window.len() >= self.window_size && window.iter().all(|r| r.timestamp >= oldest_allowed)
    }

    /// One decision per tier. `window` is oldest-first; only its last
    /// `window_size` readings are considered.
    pub fn evaluate(&self, window: &[Reading], baseline: f64, now: i64) -> Vec<EdgeDecision> {
        let window = &window[window.len().saturating_sub(self.window_size)..];
        let valid = self.window_valid(window, now);
        let latest = window.last().map(|r| r.value).unwrap_or(0.0);

        self.tiers
            .iter()
            .map(|tier| {
                let ratio = tier.ratio_for(baseline);
                let detection_state = if !valid {
                    DetectionState::InsufficientData
                } else if all_above(window, baseline * (1.0 + ratio)) {
                    DetectionState::AboveThreshold
                } else {
                    DetectionState::BelowThreshold
                };
                let relay_state = match detection_state {
                    DetectionState::AboveThreshold => RelayState::On,
                    _ => RelayState::Off,
                };
                EdgeDecision {
                    timestamp: now,
                    tier: tier.name.clone(),
                    relay_pin: tier.relay_pin,
                    reading_value: latest,
                    baseline_value: baseline,
                    threshold_ratio: ratio,
                    relay_state,
                    detection_state,
                    window_size_used: window.len(),
                    window_valid: valid,
                    override_applied: None,
                }
            })
            .collect()
    }
}

fn all_above(window: &[Reading], threshold: f64) -> bool {
    !window.is_empty() && window.iter().all(|r| r.value > threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn tier(name: &str, pin: u8, ratio: f64) -> ThresholdTier {
        ThresholdTier { name: name.into(), relay_pin: pin, ratio, bands: vec![] }
    }

    /// `values` one minute apart, the last one at NOW
    fn window(values: &[f64]) -> Vec<Reading> {
        let n = values.len() as i64;
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Reading::new(NOW - (n - 1 - i as i64) * 60, *v))
            .collect()
    }

    fn detector(tiers: Vec<ThresholdTier>, size: usize) -> EdgeDetector {
        EdgeDetector::new(tiers, size, 3600)
    }

    #[test]
    fn sustained_excursion_turns_relay_on() {
        let d = detector(vec![tier("filter", 19, 0.25)], 20);
        let out = d.evaluate(&window(&[13.0; 20]), 10.0, NOW);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].relay_state, RelayState::On);
        assert_eq!(out[0].detection_state, DetectionState::AboveThreshold);
        assert!(out[0].window_valid);
        assert_eq!(out[0].window_size_used, 20);
    }

    #[test]
    fn one_sample_below_keeps_relay_off() {
        let d = detector(vec![tier("filter", 19, 0.25)], 20);
        let mut values = [13.0; 20];
        values[7] = 12.0;
        let out = d.evaluate(&window(&values), 10.0, NOW);
        assert_eq!(out[0].relay_state, RelayState::Off);
        assert_eq!(out[0].detection_state, DetectionState::BelowThreshold);
    }

    #[test]
    fn short_window_is_insufficient() {
        let d = detector(vec![tier("filter", 19, 0.25)], 20);
        let out = d.evaluate(&window(&[50.0; 19]), 10.0, NOW);
        assert_eq!(out[0].relay_state, RelayState::Off);
        assert_eq!(out[0].detection_state, DetectionState::InsufficientData);
        assert!(!out[0].window_valid);
    }

    #[test]
    fn stale_sample_invalidates_window() {
        let d = detector(vec![tier("filter", 19, 0.25)], 20);
        let mut w = window(&[50.0; 20]);
        w[0].timestamp = NOW - 3601;
        let out = d.evaluate(&w, 10.0, NOW);
        assert_eq!(out[0].detection_state, DetectionState::InsufficientData);
        assert_eq!(out[0].relay_state, RelayState::Off);
    }

    #[test]
    fn sample_exactly_at_recency_limit_counts() {
        let d = detector(vec![tier("filter", 19, 0.25)], 2);
        let w = vec![Reading::new(NOW - 3600, 20.0), Reading::new(NOW, 20.0)];
        assert!(d.window_valid(&w, NOW));
    }

    #[test]
    fn equal_to_threshold_is_not_above() {
        let d = detector(vec![tier("t10", 19, 0.1)], 10);
        let out = d.evaluate(&window(&[5.0; 10]), 5.0, NOW);
        assert_eq!(out[0].relay_state, RelayState::Off);

        let flat = detector(vec![tier("zero", 19, 0.0)], 10);
        let out = flat.evaluate(&window(&[5.0; 10]), 5.0, NOW);
        assert_eq!(out[0].detection_state, DetectionState::BelowThreshold);
    }

    #[test]
    fn tiers_are_independent() {
        let d = detector(
            vec![tier("t10", 19, 0.1), tier("t20", 26, 0.2), tier("t30", 20, 0.3), tier("t40", 21, 0.4)],
            10,
        );
        let out = d.evaluate(&window(&[12.5; 10]), 10.0, NOW);
        let states: Vec<_> = out.iter().map(|d| d.relay_state).collect();
        assert_eq!(states, vec![RelayState::On, RelayState::On, RelayState::Off, RelayState::Off]);
        assert_eq!(out[2].relay_pin, 20);
    }

    #[test]
    fn bands_pick_margin_by_baseline() {
        let t = ThresholdTier {
            name: "filter".into(),
            relay_pin: 19,
            ratio: 0.5,
            bands: vec![RatioBand { min_baseline: 10.0, ratio: 0.25 }, RatioBand { min_baseline: 30.0, ratio: 0.1 }],
        };
        assert_eq!(t.ratio_for(7.5), 0.5);
        assert_eq!(t.ratio_for(10.0), 0.25);
        assert_eq!(t.ratio_for(45.0), 0.1);
    }

    #[test]
    fn low_baseline_needs_wider_margin() {
        let t = ThresholdTier {
            name: "filter".into(),
            relay_pin: 19,
            ratio: 0.5,
            bands: vec![RatioBand { min_baseline: 10.0, ratio: 0.25 }],
        };
        let d = detector(vec![t], 20);
        // 1.4x an 8.0 baseline clears 0.25 but not 0.5
        let out = d.evaluate(&window(&[11.2; 20]), 8.0, NOW);
        assert_eq!(out[0].threshold_ratio, 0.5);
        assert_eq!(out[0].relay_state, RelayState::Off);
    }

    #[test]
    fn only_the_trailing_window_is_considered() {
        let d = detector(vec![tier("filter", 19, 0.25)], 3);
        let out = d.evaluate(&window(&[1.0, 1.0, 20.0, 20.0, 20.0]), 10.0, NOW);
        assert_eq!(out[0].window_size_used, 3);
        assert_eq!(out[0].relay_state, RelayState::On);
        assert_eq!(out[0].reading_value, 20.0);
    }

    #[test]
    fn blackout_bounds_are_half_open() {
        let w = BlackoutWindow::parse("05:00", "06:00").unwrap();
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(w.contains(t(5, 0)));
        assert!(w.contains(t(5, 59)));
        assert!(!w.contains(t(6, 0)));
        assert!(!w.contains(t(4, 59)));
    }

    #[test]
    fn blackout_wraps_midnight() {
        let w = BlackoutWindow::parse("23:30", "00:30").unwrap();
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(w.contains(t(23, 45)));
        assert!(w.contains(t(0, 10)));
        assert!(!w.contains(t(12, 0)));
    }

    #[test]
    fn blackout_rejects_garbage() {
        assert!(BlackoutWindow::parse("5am", "06:00").is_err());
        assert!(BlackoutWindow::parse("06:00", "06:00").is_err());
    }
}
