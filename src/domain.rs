use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// one particulate sample
///
/// immutable once recorded; superseded by newer readings, never mutated.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Reading {
    /// seconds since unix epoch
    pub timestamp: i64,
    /// PM2.5 concentration in µg/m³
    pub value: f64,
}

impl Reading {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayState {
    On,
    #[default]
    Off,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::On => "ON",
            RelayState::Off => "OFF",
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, RelayState::On)
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ON" => Ok(RelayState::On),
            "OFF" => Ok(RelayState::Off),
            other => Err(format!("unknown relay state '{other}'")),
        }
    }
}

/// outcome class of one detection cycle for one tier
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionState {
    InsufficientData,
    BelowThreshold,
    AboveThreshold,
}

impl DetectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionState::InsufficientData => "INSUFFICIENT_DATA",
            DetectionState::BelowThreshold => "BELOW_THRESHOLD",
            DetectionState::AboveThreshold => "ABOVE_THRESHOLD",
        }
    }
}

impl FromStr for DetectionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSUFFICIENT_DATA" => Ok(DetectionState::InsufficientData),
            "BELOW_THRESHOLD" => Ok(DetectionState::BelowThreshold),
            "ABOVE_THRESHOLD" => Ok(DetectionState::AboveThreshold),
            other => Err(format!("unknown detection state '{other}'")),
        }
    }
}

/// operator command that supersedes the detector's relay decision
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlOverride {
    /// every relay latched OFF until resumed
    EmergencyStop,
    /// every relay forced ON until the override expires
    ManualOn,
}

impl ControlOverride {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlOverride::EmergencyStop => "emergency_stop",
            ControlOverride::ManualOn => "manual_on",
        }
    }

    pub fn forced_state(&self) -> RelayState {
        match self {
            ControlOverride::EmergencyStop => RelayState::Off,
            ControlOverride::ManualOn => RelayState::On,
        }
    }
}

impl FromStr for ControlOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "emergency_stop" => Ok(ControlOverride::EmergencyStop),
            "manual_on" => Ok(ControlOverride::ManualOn),
            other => Err(format!("unknown override '{other}'")),
        }
    }
}

/// reference ambient level the detector compares against
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Baseline {
    pub value: f64,
    pub computed_at: i64,
}

/// one baseline computation as persisted
///
/// `candidate` is the raw calibration average; outlier rejection compares new
/// candidates against prior candidates, so they are kept even when rejected.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct BaselineRecord {
    pub computed_at: i64,
    pub candidate: f64,
    /// accepted baseline after outlier rejection and floor clamp
    pub value: f64,
    pub rejected: bool,
}

impl BaselineRecord {
    pub fn baseline(&self) -> Baseline {
        Baseline { value: self.value, computed_at: self.computed_at }
    }
}

/// one detection outcome for one threshold tier, with its evidence
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct EdgeDecision {
    pub timestamp: i64,
    pub tier: String,
    pub relay_pin: u8,
    pub reading_value: f64,
    pub baseline_value: f64,
    pub threshold_ratio: f64,
    /// state actually commanded (after any override)
    pub relay_state: RelayState,
    pub detection_state: DetectionState,
    pub window_size_used: usize,
    pub window_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_applied: Option<ControlOverride>,
}

impl EdgeDecision {
    /// the state the detector alone would have chosen
    pub fn detected_state(&self) -> RelayState {
        match self.detection_state {
            DetectionState::AboveThreshold => RelayState::On,
            _ => RelayState::Off,
        }
    }
}

/// auxiliary readings captured alongside the particulate sample
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct Environment {
    /// temperature in fahrenheit
    pub temperature: Option<f64>,
    /// relative humidity (0-100%)
    pub humidity: Option<f64>,
    /// differential pressure in Pa
    pub pressure: Option<f64>,
}

/// latest cycle results shared with the status api
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct StatusSnapshot {
    pub last_reading: Option<Reading>,
    pub baseline: Option<Baseline>,
    pub decisions: Vec<EdgeDecision>,
    pub environment: Environment,
    pub active_override: Option<ControlOverride>,
    /// unix timestamp (s) of last completed cycle
    pub last_update: i64,
    pub cycles_skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_state_round_trips_through_text() {
        assert_eq!("ON".parse::<RelayState>(), Ok(RelayState::On));
        assert_eq!(RelayState::Off.to_string(), "OFF");
        assert!("on".parse::<RelayState>().is_err());
    }

    #[test]
    fn decision_serializes_with_uppercase_states() {
        let decision = EdgeDecision {
            timestamp: 1_700_000_000,
            tier: "filter".into(),
            relay_pin: 19,
            reading_value: 13.0,
            baseline_value: 10.0,
            threshold_ratio: 0.25,
            relay_state: RelayState::On,
            detection_state: DetectionState::AboveThreshold,
            window_size_used: 20,
            window_valid: true,
            override_applied: None,
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["relay_state"], "ON");
        assert_eq!(json["detection_state"], "ABOVE_THRESHOLD");
        assert!(json.get("override_applied").is_none());
    }

    #[test]
    fn overrides_force_expected_states() {
        assert_eq!(ControlOverride::EmergencyStop.forced_state(), RelayState::Off);
        assert_eq!(ControlOverride::ManualOn.forced_state(), RelayState::On);
    }
}
