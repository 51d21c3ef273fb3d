//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for the hardware the monitor touches:
//!     the SPS30 particulate sensor and SDP810 pressure sensor (I2C), the
//!     BME280 climate sensor, and the relay outputs (GPIO).
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (using `rppal`) and a development machine (using mocks).
//!
//! layering:
//!     HardwareProvider   raw bus access (i2c bytes, gpio levels)
//!           │
//!     Sps30 / Sdp810 / Bme280 / GpioRelay
//!           │            device protocols, built on sensirion.rs
//!     ParticulateSensor / RelayDriver / ClimateSensor / PressureSensor
//!                        what the detection core depends on
//!
//! relationships:
//!     - used by: source.rs (particulate), actuation.rs (relays), monitor.rs
//!     - uses: rppal (on feature="hardware")
//!     - uses: std::process::Command (python BME280 driver until ported),
//!       always run under a deadline so a hung helper cannot stall a cycle
//!
//! ==============================================================================

use crate::domain::RelayState;
use crate::error::{ActuationError, SensorError};
use crate::sensirion;
use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::process::{Command, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// python helper start-up alone takes ~2 s on a Pi Zero
pub const HELPER_TIMEOUT: Duration = Duration::from_secs(5);

pub trait HardwareProvider: Send + Sync {
    fn i2c_transfer(&self, addr: u8, write_data: &[u8], read_len: u32) -> Result<Vec<u8>>;
    fn write_gpio(&self, pin: u8, level: bool) -> Result<()>;
    /// (temperature °C, relative humidity %)
    fn read_bme280(&self, addr: u8) -> Result<(f32, f32)>;
}

/// particulate sensor lifecycle as seen by the reading source
pub trait ParticulateSensor: Send {
    fn name(&self) -> &str;
    fn start(&mut self) -> Result<(), SensorError>;
    /// raw PM2.5 in µg/m³, unvalidated
    fn read_pm25(&mut self) -> Result<f64, SensorError>;
    fn stop(&mut self) -> Result<(), SensorError>;
}

pub trait RelayDriver: Send {
    /// idempotent: setting the current state again is harmless
    fn set_state(&mut self, pin: u8, state: RelayState) -> Result<(), ActuationError>;
}

pub trait ClimateSensor: Send {
    /// (temperature °F, relative humidity %)
    fn read_climate(&mut self) -> Result<(f64, f64), SensorError>;
}

pub trait PressureSensor: Send {
    /// differential pressure in Pa
    fn read_pressure(&mut self) -> Result<f64, SensorError>;
}

fn no_response(e: anyhow::Error) -> SensorError {
    SensorError::NoResponse(format!("{e:#}"))
}

// ==============================================================================================
// DEVICE DRIVERS (bus-agnostic)
// ==============================================================================================

pub struct Sps30 {
    hal: Arc<dyn HardwareProvider>,
    address: u8,
    started: bool,
}

impl Sps30 {
    pub fn new(hal: Arc<dyn HardwareProvider>, address: u8) -> Self {
        Self { hal, address, started: false }
    }
}

impl ParticulateSensor for Sps30 {
    fn name(&self) -> &str {
        "sps30"
    }

    fn start(&mut self) -> Result<(), SensorError> {
        self.hal
            .i2c_transfer(self.address, &sensirion::sps30_start_frame(), 0)
            .map_err(no_response)?;
        self.started = true;
        Ok(())
    }

    fn read_pm25(&mut self) -> Result<f64, SensorError> {
        if !self.started {
            return Err(SensorError::NotStarted);
        }
        let ready = self
            .hal
            .i2c_transfer(self.address, &sensirion::SPS30_CMD_DATA_READY, 3)
            .map_err(no_response)?;
        if !sensirion::sps30_data_ready(&ready)? {
            return Err(SensorError::NullReading);
        }
        let frame = self
            .hal
            .i2c_transfer(
                self.address,
                &sensirion::SPS30_CMD_READ_VALUES,
                sensirion::SPS30_MEASURED_VALUES_LEN as u32,
            )
            .map_err(no_response)?;
        sensirion::sps30_pm25(&frame)
    }

    fn stop(&mut self) -> Result<(), SensorError> {
        self.started = false;
        self.hal
            .i2c_transfer(self.address, &sensirion::SPS30_CMD_STOP, 0)
            .map(|_| ())
            .map_err(no_response)
    }
}

pub struct Sdp810 {
    hal: Arc<dyn HardwareProvider>,
    address: u8,
}

impl Sdp810 {
    /// stops any running measurement and starts continuous mode
    pub fn start(hal: Arc<dyn HardwareProvider>, address: u8) -> Result<Self, SensorError> {
        hal.i2c_transfer(address, &[0x3F, 0xF9], 0).map_err(no_response)?;
        std::thread::sleep(std::time::Duration::from_millis(800));
        hal.i2c_transfer(address, &[0x36, 0x03], 0).map_err(no_response)?;
        Ok(Self { hal, address })
    }
}

impl PressureSensor for Sdp810 {
    fn read_pressure(&mut self) -> Result<f64, SensorError> {
        let frame = self.hal.i2c_transfer(self.address, &[], 9).map_err(no_response)?;
        sensirion::sdp810_pressure(&frame)
    }
}

pub struct Bme280 {
    hal: Arc<dyn HardwareProvider>,
    address: u8,
}

impl Bme280 {
    pub fn new(hal: Arc<dyn HardwareProvider>, address: u8) -> Self {
        Self { hal, address }
    }
}

impl ClimateSensor for Bme280 {
    fn read_climate(&mut self) -> Result<(f64, f64), SensorError> {
        let (celsius, humidity) = self.hal.read_bme280(self.address).map_err(no_response)?;
        Ok((celsius_to_fahrenheit(f64::from(celsius)), f64::from(humidity)))
    }
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// relay outputs on plain gpio pins
pub struct GpioRelay {
    hal: Arc<dyn HardwareProvider>,
    active_low: bool,
}

impl GpioRelay {
    pub fn new(hal: Arc<dyn HardwareProvider>, active_low: bool) -> Self {
        Self { hal, active_low }
    }

    fn level_for(&self, state: RelayState) -> bool {
        state.is_on() != self.active_low
    }
}

impl RelayDriver for GpioRelay {
    fn set_state(&mut self, pin: u8, state: RelayState) -> Result<(), ActuationError> {
        self.hal
            .write_gpio(pin, self.level_for(state))
            .map_err(|e| ActuationError { pin, state, reason: format!("{e:#}") })
    }
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For WSL / Non-Hardware Build)
// ==============================================================================================
#[cfg(not(feature = "hardware"))]
pub struct Hal {
    gpio: Mutex<HashMap<u8, bool>>,
    tick: std::sync::atomic::AtomicU64,
}

#[cfg(not(feature = "hardware"))]
impl Hal {
    pub fn new() -> Self {
        tracing::info!("Using MOCK HAL (No hardware access)");
        Self { gpio: Mutex::new(HashMap::new()), tick: std::sync::atomic::AtomicU64::new(0) }
    }

    /// slow sine around 8 µg/m³, enough to exercise the pipeline on a laptop
    fn simulated_pm25(&self) -> f32 {
        let t = self.tick.fetch_add(1, std::sync::atomic::Ordering::SeqCst) as f32;
        8.0 + 2.0 * (t / 30.0).sin()
    }

    pub fn gpio_level(&self, pin: u8) -> Option<bool> {
        self.gpio.lock().ok().and_then(|g| g.get(&pin).copied())
    }
}

#[cfg(not(feature = "hardware"))]
impl Default for Hal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(feature = "hardware"))]
impl HardwareProvider for Hal {
    fn i2c_transfer(&self, addr: u8, write_data: &[u8], read_len: u32) -> Result<Vec<u8>> {
        tracing::trace!("[MOCK I2C] Addr: 0x{:02X}, Write: {:?}, ReadLen: {}", addr, write_data, read_len);
        if read_len == 0 {
            return Ok(vec![]);
        }
        let response = match (write_data, read_len as usize) {
            (cmd, 3) if cmd == sensirion::SPS30_CMD_DATA_READY => {
                vec![0x00, 0x01, sensirion::crc8(&[0x00, 0x01])]
            }
            (cmd, sensirion::SPS30_MEASURED_VALUES_LEN) if cmd == sensirion::SPS30_CMD_READ_VALUES => {
                let pm25 = self.simulated_pm25();
                sensirion::sps30_encode_values(&[pm25 * 0.8, pm25, pm25 * 1.1, pm25 * 1.2, 0.0, 0.0, 0.0, 0.0, 0.0, 0.5])
            }
            // sdp810 continuous read: ~9.4 Pa
            ([], 9) => vec![10, 0, sensirion::crc8(&[10, 0]), 0, 0, 0x81, 0, 0, 0x81],
            _ => vec![0u8; read_len as usize],
        };
        Ok(response)
    }

    fn write_gpio(&self, pin: u8, level: bool) -> Result<()> {
        tracing::debug!("[MOCK GPIO] Pin {} write {}", pin, level);
        self.gpio
            .lock()
            .map_err(|_| anyhow::anyhow!("mock gpio lock poisoned"))?
            .insert(pin, level);
        Ok(())
    }

    fn read_bme280(&self, addr: u8) -> Result<(f32, f32)> {
        tracing::trace!("[MOCK BME280] Reading 0x{:02X}", addr);
        Ok((21.5, 40.0))
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================
#[cfg(feature = "hardware")]
pub struct Hal {
    i2c: Mutex<()>,
}

#[cfg(feature = "hardware")]
impl Hal {
    pub fn new() -> Self {
        tracing::info!("Using REAL HARDWARE HAL (rppal)");
        Self { i2c: Mutex::new(()) }
    }
}

#[cfg(feature = "hardware")]
impl Default for Hal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "hardware")]
impl HardwareProvider for Hal {
    fn i2c_transfer(&self, addr: u8, write_data: &[u8], read_len: u32) -> Result<Vec<u8>> {
        use rppal::i2c::I2c;
        // one transaction on the bus at a time; sensors share /dev/i2c-1
        let _bus = self.i2c.lock().map_err(|_| anyhow::anyhow!("i2c lock poisoned"))?;
        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr as u16)?;

        if !write_data.is_empty() {
            i2c.write(write_data)?;
        }

        if read_len > 0 {
            let mut read_buf = vec![0u8; read_len as usize];
            i2c.read(&mut read_buf)?;
            Ok(read_buf)
        } else {
            Ok(vec![])
        }
    }

    fn write_gpio(&self, pin: u8, level: bool) -> Result<()> {
        use rppal::gpio::Gpio;
        let gpio = Gpio::new()?;
        let mut p = gpio.get(pin)?.into_output();
        // CRITICAL: Prevent GPIO from resetting when dropped
        // Without this, the relay drops out as soon as this function returns
        p.set_reset_on_drop(false);
        if level { p.set_high(); } else { p.set_low(); }
        Ok(())
    }

    fn read_bme280(&self, addr: u8) -> Result<(f32, f32)> {
        // NOTE: compensation math lives in the Adafruit driver; shell out until ported.
        let script = format!(
            r#"
import Adafruit_BME280, json
try:
    s = Adafruit_BME280.BME280(address=0x{:02X})
    print(json.dumps({{"t": s.read_temperature(), "h": s.read_humidity()}}))
except Exception:
    print("null")
"#,
            addr
        );
        let output = output_within(Command::new("python3").args(["-c", &script]), HELPER_TIMEOUT)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim() == "null" || stdout.trim().is_empty() {
            anyhow::bail!("BME280 read failed");
        }
        let v: serde_json::Value = serde_json::from_str(stdout.trim())?;
        let t = v["t"].as_f64().ok_or_else(|| anyhow::anyhow!("Missing temp"))?;
        let h = v["h"].as_f64().ok_or_else(|| anyhow::anyhow!("Missing humidity"))?;
        Ok((t as f32, h as f32))
    }
}

/// Runs a helper process to completion, killing it once it outlives `limit`.
pub fn output_within(cmd: &mut Command, limit: Duration) -> Result<Output> {
    let mut child = cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null()).spawn()?;
    let deadline = Instant::now() + limit;
    loop {
        if child.try_wait()?.is_some() {
            return Ok(child.wait_with_output()?);
        }
        if Instant::now() >= deadline {
            if let Err(e) = child.kill() {
                tracing::warn!("[HAL] could not kill helper: {}", e);
            }
            // reap it so no zombie is left behind
            let _ = child.wait();
            anyhow::bail!("helper did not finish within {:?}", limit);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

// ==============================================================================================
// SCRIPTED DEVICES (tests and dry runs)
// ==============================================================================================

/// particulate sensor that replays queued results, then repeats a fallback
#[derive(Clone)]
pub struct ScriptedSensor {
    queue: Arc<Mutex<VecDeque<Result<f64, SensorError>>>>,
    fallback: Arc<Mutex<Result<f64, SensorError>>>,
    lifecycle: Arc<Mutex<Vec<&'static str>>>,
}

impl ScriptedSensor {
    pub fn constant(value: f64) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(Ok(value))),
            lifecycle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, result: Result<f64, SensorError>) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(result);
        }
    }

    pub fn set_fallback(&self, result: Result<f64, SensorError>) {
        if let Ok(mut f) = self.fallback.lock() {
            *f = result;
        }
    }

    /// "start"/"stop" calls in order
    pub fn lifecycle(&self) -> Vec<&'static str> {
        self.lifecycle.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl ParticulateSensor for ScriptedSensor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn start(&mut self) -> Result<(), SensorError> {
        if let Ok(mut l) = self.lifecycle.lock() {
            l.push("start");
        }
        Ok(())
    }

    fn read_pm25(&mut self) -> Result<f64, SensorError> {
        let queued = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        match queued {
            Some(result) => result,
            None => self
                .fallback
                .lock()
                .map(|f| f.clone())
                .unwrap_or(Err(SensorError::NullReading)),
        }
    }

    fn stop(&mut self) -> Result<(), SensorError> {
        if let Ok(mut l) = self.lifecycle.lock() {
            l.push("stop");
        }
        Ok(())
    }
}

/// relay driver that remembers every command and can be told to fail
#[derive(Clone, Default)]
pub struct RecordingRelay {
    commands: Arc<Mutex<Vec<(u8, RelayState)>>>,
    levels: Arc<Mutex<HashMap<u8, RelayState>>>,
    failing: Arc<std::sync::atomic::AtomicBool>,
}

impl RecordingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn state(&self, pin: u8) -> Option<RelayState> {
        self.levels.lock().ok().and_then(|l| l.get(&pin).copied())
    }

    pub fn commands(&self) -> Vec<(u8, RelayState)> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl RelayDriver for RecordingRelay {
    fn set_state(&mut self, pin: u8, state: RelayState) -> Result<(), ActuationError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ActuationError { pin, state, reason: "simulated gpio fault".into() });
        }
        if let Ok(mut c) = self.commands.lock() {
            c.push((pin, state));
        }
        if let Ok(mut l) = self.levels.lock() {
            l.insert(pin, state);
        }
        Ok(())
    }
}

/// mock bus whose first `failures` i2c transfers NACK
#[cfg(all(test, not(feature = "hardware")))]
pub(crate) struct FlakyBus {
    inner: Hal,
    failures: std::sync::atomic::AtomicU32,
    pub transfers: std::sync::atomic::AtomicU32,
}

#[cfg(all(test, not(feature = "hardware")))]
impl FlakyBus {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: Hal::new(),
            failures: std::sync::atomic::AtomicU32::new(failures),
            transfers: std::sync::atomic::AtomicU32::new(0),
        }
    }
}

#[cfg(all(test, not(feature = "hardware")))]
impl HardwareProvider for FlakyBus {
    fn i2c_transfer(&self, addr: u8, write_data: &[u8], read_len: u32) -> Result<Vec<u8>> {
        use std::sync::atomic::Ordering::SeqCst;
        self.transfers.fetch_add(1, SeqCst);
        if self.failures.fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1)).is_ok() {
            anyhow::bail!("i2c nack");
        }
        self.inner.i2c_transfer(addr, write_data, read_len)
    }

    fn write_gpio(&self, pin: u8, level: bool) -> Result<()> {
        self.inner.write_gpio(pin, level)
    }

    fn read_bme280(&self, addr: u8) -> Result<(f32, f32)> {
        self.inner.read_bme280(addr)
    }
}

#[cfg(all(test, not(feature = "hardware")))]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::source::{LocalSource, ReadingSource};

    #[test]
    fn sps30_over_mock_bus_yields_plausible_pm25() {
        let hal: Arc<dyn HardwareProvider> = Arc::new(Hal::new());
        let mut sensor = Sps30::new(hal, sensirion::SPS30_DEFAULT_ADDRESS);
        assert_eq!(sensor.read_pm25(), Err(SensorError::NotStarted));
        sensor.start().unwrap();
        let v = sensor.read_pm25().unwrap();
        assert!((6.0..=10.0).contains(&v), "got {v}");
        sensor.stop().unwrap();
        assert_eq!(sensor.read_pm25(), Err(SensorError::NotStarted));
    }

    #[test]
    fn active_low_relay_inverts_level() {
        let hal = Arc::new(Hal::new());
        let mut relay = GpioRelay::new(hal.clone(), true);
        relay.set_state(17, RelayState::On).unwrap();
        assert_eq!(hal.gpio_level(17), Some(false));
        relay.set_state(17, RelayState::Off).unwrap();
        assert_eq!(hal.gpio_level(17), Some(true));
    }

    #[test]
    fn sdp810_over_mock_bus() {
        let hal: Arc<dyn HardwareProvider> = Arc::new(Hal::new());
        let mut sdp = Sdp810 { hal, address: 0x25 };
        let p = sdp.read_pressure().unwrap();
        assert!((p - 9.375).abs() < 1e-9);
    }

    #[test]
    fn bme280_reports_fahrenheit() {
        let hal: Arc<dyn HardwareProvider> = Arc::new(Hal::new());
        let mut bme = Bme280::new(hal, 0x77);
        let (t, h) = bme.read_climate().unwrap();
        assert!((t - 70.7).abs() < 1e-9);
        assert_eq!(h, 40.0);
    }

    #[test]
    fn scripted_sensor_drains_queue_then_falls_back() {
        let mut s = ScriptedSensor::constant(5.0);
        s.push(Err(SensorError::NullReading));
        s.push(Ok(9.0));
        assert_eq!(s.read_pm25(), Err(SensorError::NullReading));
        assert_eq!(s.read_pm25(), Ok(9.0));
        assert_eq!(s.read_pm25(), Ok(5.0));
    }

    fn sps30_source(bus: Arc<FlakyBus>, clock: Arc<ManualClock>) -> LocalSource {
        let sensor = Sps30::new(bus, sensirion::SPS30_DEFAULT_ADDRESS);
        LocalSource::new(Box::new(sensor), clock, Duration::ZERO, 1000.0)
    }

    #[test]
    fn failed_boot_start_is_retried_on_next_sample() {
        let bus = Arc::new(FlakyBus::new(1));
        let clock = Arc::new(ManualClock::new(1_000));
        let mut src = sps30_source(bus, clock.clone());

        assert!(src.start().is_err());
        // restart happens here; this cycle is still skipped
        assert_eq!(src.sample(), Err(SensorError::NotStarted));
        clock.advance(60);
        assert!(src.sample().is_ok());
    }

    #[test]
    fn restart_attempts_back_off() {
        use std::sync::atomic::Ordering::SeqCst;
        let bus = Arc::new(FlakyBus::new(2));
        let clock = Arc::new(ManualClock::new(1_000));
        let mut src = sps30_source(bus.clone(), clock.clone());

        assert!(src.start().is_err());
        assert_eq!(src.sample(), Err(SensorError::NotStarted));
        assert_eq!(bus.transfers.load(SeqCst), 2);

        clock.advance(10);
        assert_eq!(src.sample(), Err(SensorError::NotStarted));
        assert_eq!(bus.transfers.load(SeqCst), 2, "no attempt inside the backoff");

        clock.advance(30);
        assert_eq!(src.sample(), Err(SensorError::NotStarted));
        assert_eq!(bus.transfers.load(SeqCst), 3);
        clock.advance(60);
        assert!(src.sample().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn helper_output_is_collected() {
        let out = output_within(Command::new("sh").args(["-c", "echo 21.5"]), Duration::from_secs(5)).unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "21.5");
    }

    #[cfg(unix)]
    #[test]
    fn hung_helper_is_killed_at_deadline() {
        let started = Instant::now();
        let result = output_within(Command::new("sh").args(["-c", "sleep 10"]), Duration::from_millis(200));
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
