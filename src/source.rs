//! ==============================================================================
//! source.rs - Reading Source Adapter
//! ==============================================================================
//!
//! purpose:
//!     turns "whatever produces PM2.5 numbers" into validated `Reading`s.
//!     every failure comes back as a `SensorError`, which the detection loop
//!     treats as "skip this cycle, record nothing".
//!
//! sources:
//!     - LocalSource: a ParticulateSensor on this board (SPS30 or scripted)
//!     - RemoteSource: the latest value a satellite node published over MQTT
//!
//! also here:
//!     - EnvironmentProbe: optional temperature/humidity/pressure captured
//!       next to each reading. never fails the cycle.
//!
//! ==============================================================================

use crate::clock::Clock;
use crate::domain::{Environment, Reading};
use crate::error::SensorError;
use crate::hal::{ClimateSensor, ParticulateSensor, PressureSensor};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait ReadingSource: Send {
    fn name(&self) -> &str;
    /// power up and settle; blocks for the settle time
    fn start(&mut self) -> Result<(), SensorError>;
    fn sample(&mut self) -> Result<Reading, SensorError>;
    fn stop(&mut self) -> Result<(), SensorError>;
}

/// Rejects values no healthy sensor reports.
pub fn validate(value: f64, max_valid: f64) -> Result<f64, SensorError> {
    if value.is_nan() {
        return Err(SensorError::NullReading);
    }
    if !value.is_finite() || value < 0.0 || value > max_valid {
        return Err(SensorError::OutOfRange { value, min: 0.0, max: max_valid });
    }
    Ok(value)
}

/// first retry delay after a failed restart; doubles up to the max
const RESTART_BACKOFF_MIN_SECS: i64 = 30;
const RESTART_BACKOFF_MAX_SECS: i64 = 900;

pub struct LocalSource {
    sensor: Box<dyn ParticulateSensor>,
    clock: Arc<dyn Clock>,
    settle: Duration,
    max_valid: f64,
    /// earliest time the next restart may be tried
    restart_at: i64,
    restart_backoff: i64,
}

impl LocalSource {
    pub fn new(
        sensor: Box<dyn ParticulateSensor>,
        clock: Arc<dyn Clock>,
        settle: Duration,
        max_valid: f64,
    ) -> Self {
        Self {
            sensor,
            clock,
            settle,
            max_valid,
            restart_at: i64::MIN,
            restart_backoff: RESTART_BACKOFF_MIN_SECS,
        }
    }

    /// The sensor is not measuring (e.g. its start failed at boot). Try to
    /// bring it back, but at most once per backoff period; the current
    /// cycle is skipped either way.
    fn restart(&mut self) {
        let now = self.clock.now();
        if now < self.restart_at {
            return;
        }
        match self.start() {
            Ok(()) => {
                tracing::info!("[SENSOR] {} restarted", self.sensor.name());
                self.restart_backoff = RESTART_BACKOFF_MIN_SECS;
                self.restart_at = i64::MIN;
            }
            Err(e) => {
                tracing::warn!(
                    "[SENSOR] {} restart failed: {} - next attempt in {}s",
                    self.sensor.name(),
                    e,
                    self.restart_backoff
                );
                self.restart_at = now.saturating_add(self.restart_backoff);
                self.restart_backoff = (self.restart_backoff * 2).min(RESTART_BACKOFF_MAX_SECS);
            }
        }
    }
}

impl ReadingSource for LocalSource {
    fn name(&self) -> &str {
        self.sensor.name()
    }

    fn start(&mut self) -> Result<(), SensorError> {
        self.sensor.start()?;
        if !self.settle.is_zero() {
            tracing::info!("[SENSOR] {} started, settling for {:?}", self.sensor.name(), self.settle);
            std::thread::sleep(self.settle);
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<Reading, SensorError> {
        let value = match self.sensor.read_pm25() {
            Ok(value) => value,
            Err(SensorError::NotStarted) => {
                self.restart();
                return Err(SensorError::NotStarted);
            }
            Err(e) => return Err(e),
        };
        let value = validate(value, self.max_valid)?;
        Ok(Reading::new(self.clock.now(), value))
    }

    fn stop(&mut self) -> Result<(), SensorError> {
        self.sensor.stop()
    }
}

/// Pulls a PM2.5 value out of a satellite payload: a bare number, or a JSON
/// object carrying `pm2_5`, `PM2.5` or `pm25`.
pub fn parse_satellite_payload(payload: &[u8]) -> Option<f64> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    if let Some(v) = value.as_f64() {
        return Some(v);
    }
    ["pm2_5", "PM2.5", "pm25"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_f64()))
}

/// Latest satellite reading, written by the MQTT handler and read by
/// `RemoteSource`. Cheap to clone.
#[derive(Clone, Default)]
pub struct RemoteFeed {
    latest: Arc<Mutex<Option<Reading>>>,
}

impl RemoteFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a payload as the latest reading, stamped with arrival time.
    pub fn ingest(&self, payload: &[u8], received_at: i64) -> bool {
        match parse_satellite_payload(payload) {
            Some(value) => {
                if let Ok(mut latest) = self.latest.lock() {
                    *latest = Some(Reading::new(received_at, value));
                }
                true
            }
            None => {
                tracing::warn!("[REMOTE] ignoring unparseable payload: {}", String::from_utf8_lossy(payload));
                false
            }
        }
    }

    pub fn latest(&self) -> Option<Reading> {
        self.latest.lock().ok().and_then(|l| *l)
    }
}

pub struct RemoteSource {
    feed: RemoteFeed,
    clock: Arc<dyn Clock>,
    max_age_secs: u64,
    max_valid: f64,
    /// timestamp of the last reading handed out, so one message counts once
    delivered: Option<i64>,
}

impl RemoteSource {
    pub fn new(feed: RemoteFeed, clock: Arc<dyn Clock>, max_age_secs: u64, max_valid: f64) -> Self {
        Self { feed, clock, max_age_secs, max_valid, delivered: None }
    }
}

impl ReadingSource for RemoteSource {
    fn name(&self) -> &str {
        "remote"
    }

    fn start(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn sample(&mut self) -> Result<Reading, SensorError> {
        let reading = self.feed.latest().ok_or(SensorError::NullReading)?;
        let age_secs = self.clock.now() - reading.timestamp;
        if age_secs > i64::try_from(self.max_age_secs).unwrap_or(i64::MAX) {
            return Err(SensorError::Stale { age_secs, limit_secs: self.max_age_secs });
        }
        if self.delivered == Some(reading.timestamp) {
            return Err(SensorError::NullReading);
        }
        validate(reading.value, self.max_valid)?;
        self.delivered = Some(reading.timestamp);
        Ok(reading)
    }

    fn stop(&mut self) -> Result<(), SensorError> {
        Ok(())
    }
}

/// Optional auxiliary sensors. A failed read leaves that field `None`.
#[derive(Default)]
pub struct EnvironmentProbe {
    climate: Option<Box<dyn ClimateSensor>>,
    pressure: Option<Box<dyn PressureSensor>>,
}

impl EnvironmentProbe {
    pub fn new(
        climate: Option<Box<dyn ClimateSensor>>,
        pressure: Option<Box<dyn PressureSensor>>,
    ) -> Self {
        Self { climate, pressure }
    }

    pub fn capture(&mut self) -> Environment {
        let mut env = Environment::default();
        if let Some(climate) = self.climate.as_mut() {
            match climate.read_climate() {
                Ok((t, h)) => {
                    env.temperature = Some(t);
                    env.humidity = Some(h);
                }
                Err(e) => tracing::debug!("[ENV] climate read failed: {}", e),
            }
        }
        if let Some(pressure) = self.pressure.as_mut() {
            match pressure.read_pressure() {
                Ok(p) => env.pressure = Some(p),
                Err(e) => tracing::debug!("[ENV] pressure read failed: {}", e),
            }
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hal::ScriptedSensor;

    fn local(sensor: ScriptedSensor, clock: Arc<ManualClock>) -> LocalSource {
        LocalSource::new(Box::new(sensor), clock, Duration::ZERO, 1000.0)
    }

    #[test]
    fn valid_value_becomes_timestamped_reading() {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let mut src = local(ScriptedSensor::constant(8.5), clock);
        assert_eq!(src.sample().unwrap(), Reading::new(1_700_000_000, 8.5));
    }

    #[test]
    fn implausible_values_are_sensor_errors() {
        let clock = Arc::new(ManualClock::new(0));
        let sensor = ScriptedSensor::constant(5.0);
        sensor.push(Ok(-1.0));
        sensor.push(Ok(f64::NAN));
        sensor.push(Ok(f64::INFINITY));
        sensor.push(Ok(1500.0));
        let mut src = local(sensor, clock);
        assert!(matches!(src.sample(), Err(SensorError::OutOfRange { .. })));
        assert_eq!(src.sample(), Err(SensorError::NullReading));
        assert!(matches!(src.sample(), Err(SensorError::OutOfRange { .. })));
        assert!(matches!(src.sample(), Err(SensorError::OutOfRange { .. })));
        assert!(src.sample().is_ok());
    }

    #[test]
    fn start_and_stop_reach_the_device() {
        let sensor = ScriptedSensor::constant(5.0);
        let mut src = local(sensor.clone(), Arc::new(ManualClock::new(0)));
        src.start().unwrap();
        src.stop().unwrap();
        assert_eq!(sensor.lifecycle(), vec!["start", "stop"]);
    }

    #[test]
    fn satellite_payload_shapes() {
        assert_eq!(parse_satellite_payload(b"12.5"), Some(12.5));
        assert_eq!(parse_satellite_payload(br#"{"pm2_5": 3.0, "temperature": 70}"#), Some(3.0));
        assert_eq!(parse_satellite_payload(br#"{"PM2.5": 4.0}"#), Some(4.0));
        assert_eq!(parse_satellite_payload(br#"{"pm10": 4.0}"#), None);
        assert_eq!(parse_satellite_payload(b"not json"), None);
    }

    #[test]
    fn remote_source_reports_stale_and_repeat_values() {
        let clock = Arc::new(ManualClock::new(1_000));
        let feed = RemoteFeed::new();
        let mut src = RemoteSource::new(feed.clone(), clock.clone(), 120, 1000.0);

        assert_eq!(src.sample(), Err(SensorError::NullReading));

        assert!(feed.ingest(br#"{"pm2_5": 9.0}"#, 1_000));
        assert_eq!(src.sample().unwrap(), Reading::new(1_000, 9.0));
        // same message again is not a new reading
        assert_eq!(src.sample(), Err(SensorError::NullReading));

        clock.advance(121);
        assert_eq!(src.sample(), Err(SensorError::Stale { age_secs: 121, limit_secs: 120 }));
    }

    struct FailingClimate;

    impl ClimateSensor for FailingClimate {
        fn read_climate(&mut self) -> Result<(f64, f64), SensorError> {
            Err(SensorError::NoResponse("bus".into()))
        }
    }

    struct FixedPressure(f64);

    impl PressureSensor for FixedPressure {
        fn read_pressure(&mut self) -> Result<f64, SensorError> {
            Ok(self.0)
        }
    }

    #[test]
    fn environment_failures_leave_fields_empty() {
        let mut probe = EnvironmentProbe::new(Some(Box::new(FailingClimate)), Some(Box::new(FixedPressure(3.2))));
        let env = probe.capture();
        assert_eq!(env.temperature, None);
        assert_eq!(env.humidity, None);
        assert_eq!(env.pressure, Some(3.2));
        assert_eq!(EnvironmentProbe::default().capture(), Environment::default());
    }
}
