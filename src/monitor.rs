//! ==============================================================================
//! monitor.rs - detection and baseline loops
//! ==============================================================================
//!
//! purpose:
//!     runs the two independent polling loops and owns the per-cycle
//!     isolation boundary: whatever goes wrong inside one cycle is logged
//!     and the next tick starts clean.
//!
//! architecture:
//!
//! ```text
//!     ┌────────────────────────────┐      ┌────────────────────────────┐
//!     │ detection loop (poll s)    │      │ baseline loop (refresh s)  │
//!     │  blackout?                 │      │  relay on? -> skip         │
//!     │  sample -> append          │      │  mean(calibration window)  │
//!     │  last_n(window) + baseline │      │  outlier rule + floor      │
//!     │  decide per tier           │      │  persist                   │
//!     │  override -> apply         │      │                            │
//!     └─────────────┬──────────────┘      └──────────────┬─────────────┘
//!                   │ reads                     writes   │
//!                   └──────────────► BaselineCell ◄──────┘
//!
//!     hardware and storage calls are blocking, so each cycle runs on the
//!     blocking pool under a timeout. the cycle sits behind an async mutex:
//!     a tick that finds it still locked is skipped instead of queued.
//! ```
//!
//! relationships:
//!     - uses: source.rs, store, detector.rs, overrides.rs, actuation.rs, baseline.rs
//!     - shares: StatusSnapshot with api.rs
//!
//! ==============================================================================

use crate::actuation::ActuationSink;
use crate::baseline::BaselineEstimator;
use crate::clock::Clock;
use crate::detector::{BlackoutWindow, EdgeDetector};
use crate::domain::{Baseline, ControlOverride, EdgeDecision, Environment, StatusSnapshot};
use crate::error::SensorError;
use crate::overrides::OverrideState;
use crate::source::{EnvironmentProbe, ReadingSource};
use crate::store::Store;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

fn update_status(status: &SharedStatus, f: impl FnOnce(&mut StatusSnapshot)) {
    match status.write() {
        Ok(mut guard) => f(&mut guard),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

/// Current baseline. Written only by the baseline loop.
#[derive(Clone)]
pub struct BaselineCell(Arc<RwLock<Baseline>>);

impl BaselineCell {
    pub fn new(initial: Baseline) -> Self {
        Self(Arc::new(RwLock::new(initial)))
    }

    pub fn get(&self) -> Baseline {
        match self.0.read() {
            Ok(b) => *b,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, baseline: Baseline) {
        match self.0.write() {
            Ok(mut b) => *b = baseline,
            Err(poisoned) => *poisoned.into_inner() = baseline,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// inside the blackout interval; no i/o, relays untouched
    Blackout,
    /// sensor failed; nothing recorded
    SensorSkipped(SensorError),
    Decided(Vec<EdgeDecision>),
}

pub struct DetectionCycle {
    pub source: Box<dyn ReadingSource>,
    pub environment: EnvironmentProbe,
    pub store: Arc<dyn Store>,
    pub detector: EdgeDetector,
    pub sink: ActuationSink,
    pub overrides: OverrideState,
    pub baseline: BaselineCell,
    pub clock: Arc<dyn Clock>,
    pub blackout: Option<BlackoutWindow>,
    pub status: SharedStatus,
    pub show_sensor_data: bool,
}

impl DetectionCycle {
    fn relay_pins(&self) -> Vec<u8> {
        let mut pins: Vec<u8> = self.detector.tiers().iter().map(|t| t.relay_pin).collect();
        pins.sort_unstable();
        pins.dedup();
        pins
    }

    /// Relays to a known OFF state, then power up the sensor.
    pub fn prepare(&mut self) {
        let pins = self.relay_pins();
        self.sink.all_off(&pins);
        match self.source.start() {
            Ok(()) => tracing::info!("[SENSOR] {} ready", self.source.name()),
            Err(e) => tracing::error!("[SENSOR] {} failed to start: {} - retrying from the detection loop", self.source.name(), e),
        }
    }

    pub fn run_once(&mut self) -> CycleOutcome {
        if let Some(blackout) = &self.blackout {
            if blackout.contains(self.clock.local_time()) {
                tracing::debug!("[CYCLE] inside blackout window - skipping");
                self.hold_safe_state();
                return CycleOutcome::Blackout;
            }
        }

        let reading = match self.source.sample() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("[SENSOR] {} - skipping cycle", e);
                update_status(&self.status, |s| s.cycles_skipped += 1);
                self.hold_safe_state();
                return CycleOutcome::SensorSkipped(e);
            }
        };
        let environment = self.environment.capture();

        if let Err(e) = self.store.append_reading(&reading) {
            tracing::error!("[STORE] failed to append reading: {}", e);
        }

        let window = match self.store.last_n(self.detector.window_size()) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!("[STORE] window query failed: {} - treating as insufficient", e);
                Vec::new()
            }
        };

        let baseline = self.baseline.get();
        let now = reading.timestamp;
        let mut decisions = self.detector.evaluate(&window, baseline.value, now);
        for decision in &mut decisions {
            self.overrides.apply(decision, now);
        }

        for decision in &decisions {
            let report = self.sink.apply(decision, &environment);
            tracing::debug!("[CYCLE] tier '{}' -> {:?}", decision.tier, report);
        }

        let summary: Vec<String> = decisions
            .iter()
            .map(|d| format!("{}:{}", d.tier, d.relay_state))
            .collect();
        if self.show_sensor_data {
            tracing::info!(
                "[PM2.5] {:.2} µg/m³ | baseline {:.2} | window {}/{} | {}",
                reading.value,
                baseline.value,
                window.len(),
                self.detector.window_size(),
                summary.join(" ")
            );
        } else {
            tracing::debug!("[PM2.5] {:.2} µg/m³ | {}", reading.value, summary.join(" "));
        }

        let active_override = self.overrides.active(now);
        update_status(&self.status, |s| {
            s.last_reading = Some(reading);
            s.baseline = Some(baseline);
            s.decisions = decisions.clone();
            s.environment = environment;
            s.active_override = active_override;
            s.last_update = now;
        });

        CycleOutcome::Decided(decisions)
    }

    /// A cycle without a fresh reading still honours an emergency stop, and
    /// drops the relays once the stored window is too old to decide on.
    /// Acts only while some relay was last commanded ON, so a long fault
    /// writes one audit row per tier, not one per cycle.
    fn hold_safe_state(&mut self) {
        let now = self.clock.now();
        let emergency = self.overrides.active(now) == Some(ControlOverride::EmergencyStop);
        let window = match self.store.last_n(self.detector.window_size()) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!("[STORE] window query failed: {} - treating as stale", e);
                Vec::new()
            }
        };
        let stale = !self.detector.window_valid(&window, now);
        if !(emergency || stale) || !self.any_relay_on() {
            return;
        }

        let baseline = self.baseline.get();
        let mut decisions = self.detector.evaluate(&window, baseline.value, now);
        for decision in &mut decisions {
            self.overrides.apply(decision, now);
        }
        let environment = Environment::default();
        for decision in &decisions {
            let report = self.sink.apply(decision, &environment);
            tracing::warn!(
                "[CYCLE] no fresh reading - tier '{}' {} ({})",
                decision.tier,
                decision.relay_state,
                if emergency { "emergency stop" } else { "stale window" }
            );
            tracing::debug!("[CYCLE] {:?}", report);
        }

        let active_override = self.overrides.active(now);
        update_status(&self.status, |s| {
            s.decisions = decisions;
            s.active_override = active_override;
            s.last_update = now;
        });
    }

    /// Latest audited cycle had a relay ON. Unknown counts as ON.
    fn any_relay_on(&self) -> bool {
        match self.store.recent_decisions(self.detector.tiers().len()) {
            Ok(latest) => latest.iter().any(|d| d.relay_state.is_on()),
            Err(e) => {
                tracing::error!("[AUDIT] could not read latest decisions: {}", e);
                true
            }
        }
    }

    /// Best-effort safe state on exit.
    pub fn shutdown(&mut self) {
        let pins = self.relay_pins();
        self.sink.all_off(&pins);
        if let Err(e) = self.source.stop() {
            tracing::warn!("[SENSOR] stop failed: {}", e);
        }
    }
}

pub async fn run_detection_loop(
    cycle: Arc<Mutex<DetectionCycle>>,
    interval: Duration,
    cycle_timeout: Duration,
    status: SharedStatus,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut guard = match cycle.clone().try_lock_owned() {
                    Ok(guard) => guard,
                    Err(_) => {
                        tracing::warn!("[CYCLE] previous cycle still running - skipping tick");
                        update_status(&status, |s| s.cycles_skipped += 1);
                        continue;
                    }
                };
                let handle = tokio::task::spawn_blocking(move || guard.run_once());
                match tokio::time::timeout(cycle_timeout, handle).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::error!("[CYCLE] cycle task failed: {}", e),
                    Err(_) => tracing::warn!("[CYCLE] cycle exceeded {:?} - later ticks skip until it returns", cycle_timeout),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("[CYCLE] detection loop shutting down");
                break;
            }
        }
    }
}

pub async fn run_baseline_loop(
    estimator: Arc<BaselineEstimator>,
    cell: BaselineCell,
    period: Duration,
    clock: Arc<dyn Clock>,
    status: SharedStatus,
    cancel: CancellationToken,
) {
    // the first refresh waits one period so the calibration window has data
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let est = estimator.clone();
                let outcome = match tokio::task::spawn_blocking(move || est.refresh()).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!("[BASELINE] refresh task failed: {}", e);
                        continue;
                    }
                };
                if let Some(baseline) = outcome.baseline(clock.now()) {
                    cell.set(baseline);
                    update_status(&status, |s| s.baseline = Some(baseline));
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("[BASELINE] baseline loop shutting down");
                break;
            }
        }
    }
}

/// Both loops plus the shared state they publish.
pub struct Monitor {
    pub cycle: Arc<Mutex<DetectionCycle>>,
    pub estimator: Arc<BaselineEstimator>,
    pub baseline: BaselineCell,
    pub status: SharedStatus,
    pub clock: Arc<dyn Clock>,
    pub poll_interval: Duration,
    pub cycle_timeout: Duration,
    pub refresh_period: Duration,
}

impl Monitor {
    /// Runs until `cancel` fires, then leaves the relays OFF.
    pub async fn run(self, cancel: CancellationToken) {
        {
            let mut guard = self.cycle.clone().lock_owned().await;
            if let Err(e) = tokio::task::spawn_blocking(move || guard.prepare()).await {
                tracing::error!("[STARTUP] prepare failed: {}", e);
            }
        }

        let detection = tokio::spawn(run_detection_loop(
            self.cycle.clone(),
            self.poll_interval,
            self.cycle_timeout,
            self.status.clone(),
            cancel.clone(),
        ));
        let baseline = tokio::spawn(run_baseline_loop(
            self.estimator.clone(),
            self.baseline.clone(),
            self.refresh_period,
            self.clock.clone(),
            self.status.clone(),
            cancel.clone(),
        ));

        let (d, b) = tokio::join!(detection, baseline);
        for result in [d, b] {
            if let Err(e) = result {
                tracing::error!("[SHUTDOWN] loop task failed: {}", e);
            }
        }

        match tokio::time::timeout(self.cycle_timeout, self.cycle.clone().lock_owned()).await {
            Ok(mut guard) => {
                if let Err(e) = tokio::task::spawn_blocking(move || guard.shutdown()).await {
                    tracing::error!("[SHUTDOWN] cleanup failed: {}", e);
                }
            }
            Err(_) => tracing::error!("[SHUTDOWN] a cycle is still running - relays not reset"),
        }
        tracing::info!("[SHUTDOWN] monitor stopped");
    }
}
