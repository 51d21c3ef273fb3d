// End-to-end detection cycles over the in-memory store and scripted devices.

use pm_edge_host::actuation::{ActuationSink, Publisher};
use pm_edge_host::baseline::{BaselineEstimator, RefreshOutcome};
use pm_edge_host::clock::{Clock, ManualClock};
use pm_edge_host::config::MonitorConfig;
use pm_edge_host::detector::{EdgeDetector, ThresholdTier};
use pm_edge_host::domain::{ControlOverride, DetectionState, RelayState};
use pm_edge_host::error::SensorError;
use pm_edge_host::hal::{RecordingRelay, ScriptedSensor};
use pm_edge_host::messaging::{LocalBus, MessageBus};
use pm_edge_host::monitor::{BaselineCell, CycleOutcome, DetectionCycle, SharedStatus};
use pm_edge_host::overrides::OverrideState;
use pm_edge_host::source::{EnvironmentProbe, LocalSource};
use pm_edge_host::store::{AuditStore, BaselineStore, HistoryStore, MemoryStore, Store};
use std::sync::Arc;
use std::time::Duration;

// 2023-11-14T22:13:20Z, clear of the default 05:00-06:00 blackout
const START: i64 = 1_700_000_000;

struct Harness {
    cycle: DetectionCycle,
    sensor: ScriptedSensor,
    relay: RecordingRelay,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    bus: Arc<LocalBus>,
    estimator: BaselineEstimator,
}

fn harness(tiers: Vec<ThresholdTier>, window: usize, initial_value: f64) -> Harness {
    let config = MonitorConfig::default();
    let clock = Arc::new(ManualClock::new(START));
    let sensor = ScriptedSensor::constant(initial_value);
    let relay = RecordingRelay::new();
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(LocalBus::new());

    let estimator = BaselineEstimator::new(store.clone(), clock.clone(), config.baseline.clone(), tiers.len());
    let baseline = BaselineCell::new(estimator.initial());
    let publisher = Publisher { bus: bus.clone(), topic: "pm25/decisions".into() };

    let cycle = DetectionCycle {
        source: Box::new(LocalSource::new(Box::new(sensor.clone()), clock.clone(), Duration::ZERO, 1000.0)),
        environment: EnvironmentProbe::default(),
        store: store.clone(),
        detector: EdgeDetector::new(tiers, window, 3600),
        sink: ActuationSink::new(Box::new(relay.clone()), store.clone(), Some(publisher)),
        overrides: OverrideState::new(1800),
        baseline,
        clock: clock.clone(),
        blackout: config.blackout_window().unwrap(),
        status: SharedStatus::default(),
        show_sensor_data: false,
    };

    Harness { cycle, sensor, relay, store, clock, bus, estimator }
}

fn tier(name: &str, pin: u8, ratio: f64) -> ThresholdTier {
    ThresholdTier { name: name.into(), relay_pin: pin, ratio, bands: vec![] }
}

fn step(h: &mut Harness) -> CycleOutcome {
    let out = h.cycle.run_once();
    h.clock.advance(60);
    out
}

#[test]
fn cold_start_uses_floor_and_triggers_on_sustained_rise() {
    let mut h = harness(vec![tier("filter", 19, 0.5)], 20, 12.0);
    assert_eq!(h.cycle.baseline.get().value, 7.5);

    for _ in 0..19 {
        step(&mut h);
    }
    assert_ne!(h.relay.state(19), Some(RelayState::On));

    let CycleOutcome::Decided(d) = step(&mut h) else { panic!("expected a decision") };
    // 12 > 7.5 * 1.5
    assert_eq!(d[0].relay_state, RelayState::On);
    assert_eq!(d[0].baseline_value, 7.5);
    assert_eq!(h.relay.state(19), Some(RelayState::On));
}

#[test]
fn sensor_errors_mid_loop_are_skipped_without_records() {
    let mut h = harness(vec![tier("filter", 19, 0.25)], 5, 9.0);
    for _ in 0..3 {
        step(&mut h);
    }
    h.sensor.push(Err(SensorError::NoResponse("i2c nack".into())));
    h.sensor.push(Err(SensorError::Sentinel(128.0)));

    assert!(matches!(step(&mut h), CycleOutcome::SensorSkipped(_)));
    assert!(matches!(step(&mut h), CycleOutcome::SensorSkipped(_)));
    assert!(matches!(step(&mut h), CycleOutcome::Decided(_)));

    assert_eq!(h.store.last_n(100).unwrap().len(), 4);
    assert_eq!(h.store.recent_decisions(100).unwrap().len(), 4);
    assert_eq!(h.bus.published().len(), 4);
    assert_eq!(h.cycle.status.read().unwrap().cycles_skipped, 2);
}

#[test]
fn refreshed_baseline_raises_the_bar() {
    let mut h = harness(vec![tier("filter", 19, 0.5)], 5, 10.0);
    for _ in 0..10 {
        step(&mut h);
    }

    let outcome = h.estimator.refresh();
    let RefreshOutcome::Updated(record) = &outcome else { panic!("expected refresh") };
    assert_eq!(record.value, 10.0);
    h.cycle.baseline.set(outcome.baseline(h.clock.now()).unwrap());

    // 12.4 clears the old line (7.5 * 1.5) but not 10 * 1.5
    h.sensor.set_fallback(Ok(12.4));
    let mut last = None;
    for _ in 0..5 {
        last = Some(step(&mut h));
    }
    let Some(CycleOutcome::Decided(d)) = last else { panic!("expected a decision") };
    assert_eq!(d[0].detection_state, DetectionState::BelowThreshold);
    assert_eq!(h.relay.state(19), Some(RelayState::Off));
}

#[test]
fn graduated_tiers_drive_separate_relays() {
    let tiers = vec![tier("t10", 19, 0.1), tier("t20", 26, 0.2), tier("t30", 20, 0.3), tier("t40", 21, 0.4)];
    let mut h = harness(tiers, 10, 10.0);
    h.cycle.baseline.set(pm_edge_host::domain::Baseline { value: 10.0, computed_at: START });
    h.sensor.set_fallback(Ok(12.5));
    for _ in 0..10 {
        step(&mut h);
    }

    assert_eq!(h.relay.state(19), Some(RelayState::On));
    assert_eq!(h.relay.state(26), Some(RelayState::On));
    assert_eq!(h.relay.state(20), Some(RelayState::Off));
    assert_eq!(h.relay.state(21), Some(RelayState::Off));
    // one audit record per tier per cycle
    assert_eq!(h.store.recent_decisions(1000).unwrap().len(), 40);
}

#[test]
fn emergency_message_latches_relays_off() {
    let mut h = harness(vec![tier("filter", 19, 0.25)], 3, 30.0);
    let overrides = h.cycle.overrides.clone();
    h.bus
        .subscribe("EmergencyShutoff", Arc::new(move |_: &str, payload: &[u8]| overrides.handle_emergency_message(payload)))
        .unwrap();

    for _ in 0..3 {
        step(&mut h);
    }
    assert_eq!(h.relay.state(19), Some(RelayState::On));

    h.bus.publish("EmergencyShutoff", b"STOP").unwrap();
    let CycleOutcome::Decided(d) = step(&mut h) else { panic!("expected a decision") };
    assert_eq!(d[0].detection_state, DetectionState::AboveThreshold);
    assert_eq!(d[0].override_applied, Some(ControlOverride::EmergencyStop));
    assert_eq!(h.relay.state(19), Some(RelayState::Off));

    h.bus.publish("EmergencyShutoff", b"RESUME").unwrap();
    step(&mut h);
    assert_eq!(h.relay.state(19), Some(RelayState::On));
}

#[test]
fn relay_fault_still_audits_and_recovers_next_cycle() {
    let mut h = harness(vec![tier("filter", 19, 0.25)], 1, 30.0);
    h.relay.set_failing(true);
    step(&mut h);
    assert_eq!(h.relay.state(19), None);
    assert_eq!(h.store.recent_decisions(1).unwrap()[0].relay_state, RelayState::On);

    h.relay.set_failing(false);
    step(&mut h);
    assert_eq!(h.relay.state(19), Some(RelayState::On));
}

#[test]
fn relay_on_blocks_calibration() {
    let mut h = harness(vec![tier("filter", 19, 0.25)], 1, 30.0);
    step(&mut h);
    assert_eq!(h.relay.state(19), Some(RelayState::On));
    assert!(matches!(h.estimator.refresh(), RefreshOutcome::Unchanged(_)));
    let store: &dyn Store = h.store.as_ref();
    assert!(store.latest_baseline().unwrap().is_none());
}

#[test]
fn stop_message_during_sensor_fault_switches_relay_off() {
    let mut h = harness(vec![tier("filter", 19, 0.25)], 3, 30.0);
    let overrides = h.cycle.overrides.clone();
    h.bus
        .subscribe("EmergencyShutoff", Arc::new(move |_: &str, payload: &[u8]| overrides.handle_emergency_message(payload)))
        .unwrap();
    for _ in 0..3 {
        step(&mut h);
    }
    assert_eq!(h.relay.state(19), Some(RelayState::On));

    h.sensor.set_fallback(Err(SensorError::NullReading));
    h.bus.publish("EmergencyShutoff", b"STOP").unwrap();
    for _ in 0..5 {
        assert!(matches!(step(&mut h), CycleOutcome::SensorSkipped(_)));
    }
    assert_eq!(h.relay.state(19), Some(RelayState::Off));
    let latest = &h.store.recent_decisions(1).unwrap()[0];
    assert_eq!(latest.override_applied, Some(ControlOverride::EmergencyStop));
    assert_eq!(h.store.last_n(100).unwrap().len(), 3);
}
