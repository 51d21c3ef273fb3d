//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `monitor.toml`.
//!     loads configuration from file or falls back to defaults, then validates
//!     it. an invalid file is fatal: the loop never starts on bad thresholds.
//!
//! structure:
//!     - PollingConfig: detection cadence and per-cycle time budget.
//!     - DetectionConfig: window size, recency limit, threshold tiers.
//!     - BaselineConfig: floor, refresh cadence, calibration window, outlier rule.
//!     - BlackoutConfig: local-time interval with no detection at all.
//!     - StorageConfig: which record store backend and where.
//!     - SensorsConfig: particulate source and optional climate/pressure sensors.
//!     - RelayConfig / MqttConfig / ApiConfig / LoggingConfig.
//!
//! ==============================================================================

use crate::detector::{BlackoutWindow, RatioBand, ThresholdTier};
use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    pub polling: PollingConfig,
    pub detection: DetectionConfig,
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub blackout: Option<BlackoutConfig>,
    pub storage: StorageConfig,
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    pub interval_seconds: u64,
    /// a cycle taking longer than this is abandoned for the tick
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    pub window_size: usize,
    pub recency_limit_seconds: u64,
    pub tiers: Vec<ThresholdTier>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BaselineConfig {
    pub floor: f64,
    pub refresh_period_seconds: u64,
    /// trailing wall-clock span averaged into a new candidate
    pub calibration_seconds: u64,
    /// when set, average the last N samples instead of a wall-clock span
    #[serde(default)]
    pub calibration_samples: Option<usize>,
    /// K: the new candidate plus K-1 prior candidates
    #[serde(default = "default_candidate_count")]
    pub candidate_count: usize,
    #[serde(default = "default_outlier_factor")]
    pub outlier_factor: f64,
    /// skip calibration while any relay is on (the filter skews the air)
    #[serde(default = "default_true")]
    pub skip_while_relay_on: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlackoutConfig {
    /// "HH:MM", local time, inclusive
    pub start: String,
    /// "HH:MM", local time, exclusive
    pub end: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Jsonl,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// directory for jsonl, database file for sqlite, ignored for memory
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParticulateSource {
    /// SPS30 on the local I2C bus (mock without the hardware feature)
    Local,
    /// latest value published by a satellite node over MQTT
    Remote,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SensorsConfig {
    pub particulate: ParticulateSource,
    pub sps30: Sps30Config,
    #[serde(default)]
    pub remote: Option<RemoteSourceConfig>,
    #[serde(default)]
    pub bme280: Option<Bme280Config>,
    #[serde(default)]
    pub sdp810: Option<Sdp810Config>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Sps30Config {
    pub i2c_address: String,
    #[serde(default = "default_settle_seconds")]
    pub settle_seconds: u64,
    /// readings above this are treated as sensor faults
    #[serde(default = "default_max_valid")]
    pub max_valid_value: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteSourceConfig {
    pub topic: String,
    pub max_age_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Bme280Config {
    pub i2c_address: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Sdp810Config {
    pub i2c_address: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RelayConfig {
    /// sainsmart-style boards switch on LOW
    #[serde(default)]
    pub active_low: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub decision_topic: String,
    #[serde(default = "default_emergency_topic")]
    pub emergency_topic: String,
    #[serde(default = "default_override_topic")]
    pub override_topic: String,
    #[serde(default = "default_override_duration")]
    pub override_duration_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: false, bind: "0.0.0.0:3000".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

fn default_cycle_timeout() -> u64 {
    20
}

fn default_candidate_count() -> usize {
    5
}

fn default_outlier_factor() -> f64 {
    1.5
}

fn default_true() -> bool {
    true
}

fn default_settle_seconds() -> u64 {
    2
}

fn default_max_valid() -> f64 {
    1000.0
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_emergency_topic() -> String {
    "EmergencyShutoff".to_string()
}

fn default_override_topic() -> String {
    "User Override".to_string()
}

fn default_override_duration() -> u64 {
    1800
}

impl MonitorConfig {
    /// Load configuration from file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, or search the usual places, or use defaults.
    ///
    /// Only a missing file falls back to defaults. A file that exists but
    /// does not parse or validate is an error. Returns the file used, if any;
    /// this runs before logging is up, so the caller reports it.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }

        let paths = [
            PathBuf::from("config").join("monitor.toml"),
            PathBuf::from("..").join("config").join("monitor.toml"),
            PathBuf::from("/etc/pm-edge-host/monitor.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Ok((Self::load(&path)?, Some(path)));
            }
        }

        let config = Self::default();
        config.validate()?;
        Ok((config, None))
    }

    /// Reject configurations the detection loop cannot run safely with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling.interval_seconds == 0 {
            return Err(ConfigError::invalid("polling.interval_seconds", "must be > 0"));
        }
        if self.polling.cycle_timeout_seconds == 0 {
            return Err(ConfigError::invalid("polling.cycle_timeout_seconds", "must be > 0"));
        }
        if self.detection.window_size == 0 {
            return Err(ConfigError::invalid("detection.window_size", "must be >= 1"));
        }
        if self.detection.recency_limit_seconds == 0 {
            return Err(ConfigError::invalid("detection.recency_limit_seconds", "must be > 0"));
        }
        if self.detection.tiers.is_empty() {
            return Err(ConfigError::invalid("detection.tiers", "at least one tier is required"));
        }

        let mut names = HashSet::new();
        for tier in &self.detection.tiers {
            if !names.insert(tier.name.as_str()) {
                return Err(ConfigError::invalid(
                    "detection.tiers",
                    format!("duplicate tier name '{}'", tier.name),
                ));
            }
            check_ratio("detection.tiers.ratio", tier.ratio)?;
            for band in &tier.bands {
                check_ratio("detection.tiers.bands.ratio", band.ratio)?;
                if !band.min_baseline.is_finite() {
                    return Err(ConfigError::invalid(
                        "detection.tiers.bands.min_baseline",
                        "must be finite",
                    ));
                }
            }
        }

        let b = &self.baseline;
        if !(b.floor.is_finite() && b.floor > 0.0) {
            return Err(ConfigError::invalid("baseline.floor", "must be a positive number"));
        }
        if b.refresh_period_seconds == 0 {
            return Err(ConfigError::invalid("baseline.refresh_period_seconds", "must be > 0"));
        }
        match b.calibration_samples {
            Some(0) => {
                return Err(ConfigError::invalid("baseline.calibration_samples", "must be >= 1"))
            }
            None if b.calibration_seconds == 0 => {
                return Err(ConfigError::invalid("baseline.calibration_seconds", "must be > 0"))
            }
            _ => {}
        }
        if b.candidate_count == 0 {
            return Err(ConfigError::invalid("baseline.candidate_count", "must be >= 1"));
        }
        if !(b.outlier_factor.is_finite() && b.outlier_factor > 1.0) {
            return Err(ConfigError::invalid("baseline.outlier_factor", "must be > 1.0"));
        }

        self.blackout_window()?;

        for (field, addr) in self.i2c_addresses() {
            parse_i2c_address(addr).map_err(|reason| ConfigError::invalid(field, reason))?;
        }
        if !(self.sensors.sps30.max_valid_value.is_finite() && self.sensors.sps30.max_valid_value > 0.0) {
            return Err(ConfigError::invalid("sensors.sps30.max_valid_value", "must be > 0"));
        }

        if self.sensors.particulate == ParticulateSource::Remote {
            if self.sensors.remote.is_none() {
                return Err(ConfigError::invalid(
                    "sensors.remote",
                    "required when sensors.particulate = \"remote\"",
                ));
            }
            if self.mqtt.is_none() {
                return Err(ConfigError::invalid(
                    "mqtt",
                    "required when sensors.particulate = \"remote\"",
                ));
            }
        }

        Ok(())
    }

    /// Parsed blackout interval, if one is configured.
    pub fn blackout_window(&self) -> Result<Option<BlackoutWindow>, ConfigError> {
        match &self.blackout {
            None => Ok(None),
            Some(cfg) => BlackoutWindow::parse(&cfg.start, &cfg.end)
                .map(Some)
                .map_err(|reason| ConfigError::invalid("blackout", reason)),
        }
    }

    fn i2c_addresses(&self) -> Vec<(&'static str, &str)> {
        let mut out = vec![("sensors.sps30.i2c_address", self.sensors.sps30.i2c_address.as_str())];
        if let Some(bme) = &self.sensors.bme280 {
            out.push(("sensors.bme280.i2c_address", bme.i2c_address.as_str()));
        }
        if let Some(sdp) = &self.sensors.sdp810 {
            out.push(("sensors.sdp810.i2c_address", sdp.i2c_address.as_str()));
        }
        out
    }

    /// Log configuration summary
    pub fn print_summary(&self) {
        tracing::info!("┌─────────────────────────────────────────┐");
        tracing::info!("│          MONITOR CONFIGURATION          │");
        tracing::info!("├─────────────────────────────────────────┤");
        tracing::info!("│ Poll Interval: {}s", self.polling.interval_seconds);
        tracing::info!("│ Window: {} samples / {}s recency", self.detection.window_size, self.detection.recency_limit_seconds);
        for tier in &self.detection.tiers {
            tracing::info!("│ Tier '{}': pin {} ratio {} ({} bands)", tier.name, tier.relay_pin, tier.ratio, tier.bands.len());
        }
        tracing::info!("│ Baseline: floor {} refresh {}s", self.baseline.floor, self.baseline.refresh_period_seconds);
        if let Some(blackout) = &self.blackout {
            tracing::info!("│ Blackout: {} - {}", blackout.start, blackout.end);
        }
        tracing::info!("│ Storage: {:?} at {}", self.storage.backend, self.storage.path.display());
        tracing::info!("│ Source: {:?}", self.sensors.particulate);
        if let Some(mqtt) = &self.mqtt {
            tracing::info!("│ MQTT: {}:{} -> '{}'", mqtt.broker, mqtt.port, mqtt.decision_topic);
        }
        tracing::info!("│ Log Level: {}", self.logging.level);
        tracing::info!("└─────────────────────────────────────────┘");
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            polling: PollingConfig { interval_seconds: 60, cycle_timeout_seconds: default_cycle_timeout() },
            detection: DetectionConfig {
                window_size: 20,
                recency_limit_seconds: 3600,
                tiers: vec![ThresholdTier {
                    name: "filter".to_string(),
                    relay_pin: 19,
                    ratio: 0.5,
                    bands: vec![RatioBand { min_baseline: 10.0, ratio: 0.25 }],
                }],
            },
            baseline: BaselineConfig {
                floor: 7.5,
                refresh_period_seconds: 3600,
                calibration_seconds: 1800,
                calibration_samples: None,
                candidate_count: default_candidate_count(),
                outlier_factor: default_outlier_factor(),
                skip_while_relay_on: true,
            },
            blackout: Some(BlackoutConfig { start: "05:00".to_string(), end: "06:00".to_string() }),
            storage: StorageConfig { backend: StorageBackend::Sqlite, path: PathBuf::from("data/pm25.db") },
            sensors: SensorsConfig {
                particulate: ParticulateSource::Local,
                sps30: Sps30Config {
                    i2c_address: "0x69".to_string(),
                    settle_seconds: default_settle_seconds(),
                    max_valid_value: default_max_valid(),
                },
                remote: None,
                bme280: None,
                sdp810: None,
            },
            relay: RelayConfig::default(),
            mqtt: None,
            api: ApiConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), show_sensor_data: true },
        }
    }
}

fn check_ratio(field: &'static str, ratio: f64) -> Result<(), ConfigError> {
    if ratio.is_finite() && ratio >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{ratio} is not a non-negative number")))
    }
}

/// Parse "0x69" / "105" style I2C addresses.
pub fn parse_i2c_address(raw: &str) -> Result<u8, String> {
    let trimmed = raw.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => trimmed.parse::<u8>(),
    };
    match parsed {
        Ok(addr) if addr <= 0x7F => Ok(addr),
        Ok(addr) => Err(format!("0x{addr:02X} is not a 7-bit address")),
        Err(e) => Err(format!("'{raw}': {e}")),
    }
}
