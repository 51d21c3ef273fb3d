//! ==============================================================================
//! main.rs - pm-edge-host entry point
//! ==============================================================================
//!
//! purpose:
//!     wires configuration, hardware, storage and messaging together and runs
//!     the monitor until Ctrl-C / SIGTERM.
//!
//! startup order:
//!     config (fatal if invalid) -> tracing -> store -> mqtt + subscriptions
//!     -> sensors -> relays OFF + sensor start -> loops + api
//!
//! shutdown:
//!     cancel token -> loops finish their current cycle -> relays OFF,
//!     sensor stop -> mqtt disconnect
//!
//! usage:
//!     pm-edge-host [path/to/monitor.toml]
//!
//! ==============================================================================

use anyhow::{Context, Result};
use pm_edge_host::actuation::{ActuationSink, Publisher};
use pm_edge_host::api::{self, ApiState};
use pm_edge_host::baseline::BaselineEstimator;
use pm_edge_host::clock::{Clock, SystemClock};
use pm_edge_host::config::{parse_i2c_address, MonitorConfig, ParticulateSource};
use pm_edge_host::detector::EdgeDetector;
use pm_edge_host::hal::{Bme280, ClimateSensor, GpioRelay, Hal, HardwareProvider, PressureSensor, Sdp810, Sps30};
use pm_edge_host::messaging::{MessageBus, MqttBus};
use pm_edge_host::monitor::{BaselineCell, DetectionCycle, Monitor, SharedStatus};
use pm_edge_host::overrides::OverrideState;
use pm_edge_host::source::{EnvironmentProbe, LocalSource, ReadingSource, RemoteFeed, RemoteSource};
use pm_edge_host::store::{open_store, MemoryStore, Retention, Store};
use pm_edge_host::telemetry::init_tracing;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: configuration. nothing else starts on an invalid file.
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let (config, config_path) =
        MonitorConfig::load_or_default(explicit.as_deref()).context("invalid configuration")?;

    init_tracing(&config.logging.level);
    tracing::info!("===========================================================");
    tracing::info!("  PM2.5 Edge Host - rising-edge filter control");
    tracing::info!("===========================================================");
    match &config_path {
        Some(path) => tracing::info!("[CONFIG] Loaded from {}", path.display()),
        None => tracing::warn!("[CONFIG] No config file found - using defaults"),
    }
    config.print_summary();

    let cancel = CancellationToken::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // step 2: storage
    let retention = Retention::for_config(&config);
    let store: Arc<dyn Store> = match open_store(&config.storage, retention) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("[STORE] {} - continuing with an in-memory store", e);
            Arc::new(MemoryStore::bounded(retention))
        }
    };

    // step 3: messaging + operator overrides
    let overrides = OverrideState::new(
        config.mqtt.as_ref().map(|m| m.override_duration_seconds).unwrap_or(1800),
    );
    let feed = RemoteFeed::new();
    let mut mqtt_task = None;
    let mut bus: Option<Arc<dyn MessageBus>> = None;
    if let Some(mqtt) = &config.mqtt {
        let (client, task) = MqttBus::connect(mqtt, cancel.clone());
        mqtt_task = Some(task);
        subscribe_controls(client.as_ref(), &config, &overrides, &feed, &clock);
        bus = Some(client as Arc<dyn MessageBus>);
    }

    // step 4: hardware
    let hal: Arc<dyn HardwareProvider> = Arc::new(Hal::new());
    let source = build_source(&config, hal.clone(), clock.clone(), feed)?;
    let environment = build_environment(&config, hal.clone()).await;
    let relay = GpioRelay::new(hal.clone(), config.relay.active_low);

    // step 5: detection core
    let publisher = match (&bus, &config.mqtt) {
        (Some(bus), Some(mqtt)) => Some(Publisher { bus: bus.clone(), topic: mqtt.decision_topic.clone() }),
        _ => None,
    };
    let estimator = Arc::new(BaselineEstimator::new(
        store.clone(),
        clock.clone(),
        config.baseline.clone(),
        config.detection.tiers.len(),
    ));
    let baseline = BaselineCell::new(estimator.initial());
    tracing::info!("[BASELINE] starting from {:.2} µg/m³", baseline.get().value);
    let status = SharedStatus::default();

    let cycle = DetectionCycle {
        source,
        environment,
        store: store.clone(),
        detector: EdgeDetector::new(
            config.detection.tiers.clone(),
            config.detection.window_size,
            config.detection.recency_limit_seconds,
        ),
        sink: ActuationSink::new(Box::new(relay), store.clone(), publisher),
        overrides: overrides.clone(),
        baseline: baseline.clone(),
        clock: clock.clone(),
        blackout: config.blackout_window()?,
        status: status.clone(),
        show_sensor_data: config.logging.show_sensor_data,
    };

    let monitor = Monitor {
        cycle: Arc::new(Mutex::new(cycle)),
        estimator,
        baseline,
        status: status.clone(),
        clock: clock.clone(),
        poll_interval: Duration::from_secs(config.polling.interval_seconds),
        cycle_timeout: Duration::from_secs(config.polling.cycle_timeout_seconds),
        refresh_period: Duration::from_secs(config.baseline.refresh_period_seconds),
    };

    // step 6: status api (optional)
    let api_task = if config.api.enabled {
        let state = ApiState { status, overrides, clock };
        let bind = config.api.bind.clone();
        let token = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(&bind, state, token).await {
                tracing::error!("[API] server error: {:#}", e);
            }
        }))
    } else {
        None
    };

    // step 7: run until interrupted
    tracing::info!(
        "[RUNTIME] polling every {}s, baseline refresh every {}s",
        config.polling.interval_seconds,
        config.baseline.refresh_period_seconds
    );
    let monitor_task = tokio::spawn(monitor.run(cancel.clone()));

    shutdown_signal().await;
    tracing::info!("[SHUTDOWN] signal received - stopping");
    cancel.cancel();

    if let Err(e) = monitor_task.await {
        tracing::error!("[SHUTDOWN] monitor task failed: {}", e);
    }
    for task in [api_task, mqtt_task].into_iter().flatten() {
        if let Err(e) = task.await {
            tracing::error!("[SHUTDOWN] background task failed: {}", e);
        }
    }
    Ok(())
}

fn subscribe_controls(
    bus: &dyn MessageBus,
    config: &MonitorConfig,
    overrides: &OverrideState,
    feed: &RemoteFeed,
    clock: &Arc<dyn Clock>,
) {
    let Some(mqtt) = &config.mqtt else { return };

    let o = overrides.clone();
    if let Err(e) = bus.subscribe(
        &mqtt.emergency_topic,
        Arc::new(move |_: &str, payload: &[u8]| o.handle_emergency_message(payload)),
    ) {
        tracing::warn!("[MQTT] {}", e);
    }

    let (o, c) = (overrides.clone(), clock.clone());
    if let Err(e) = bus.subscribe(
        &mqtt.override_topic,
        Arc::new(move |_: &str, payload: &[u8]| o.handle_override_message(payload, c.now())),
    ) {
        tracing::warn!("[MQTT] {}", e);
    }

    if let (ParticulateSource::Remote, Some(remote)) = (config.sensors.particulate, &config.sensors.remote) {
        let (f, c) = (feed.clone(), clock.clone());
        if let Err(e) = bus.subscribe(
            &remote.topic,
            Arc::new(move |_: &str, payload: &[u8]| {
                f.ingest(payload, c.now());
            }),
        ) {
            tracing::warn!("[MQTT] {}", e);
        }
    }
}

fn build_source(
    config: &MonitorConfig,
    hal: Arc<dyn HardwareProvider>,
    clock: Arc<dyn Clock>,
    feed: RemoteFeed,
) -> Result<Box<dyn ReadingSource>> {
    let sps30 = &config.sensors.sps30;
    let source: Box<dyn ReadingSource> = match config.sensors.particulate {
        ParticulateSource::Local => {
            let addr = parse_i2c_address(&sps30.i2c_address).map_err(anyhow::Error::msg)?;
            Box::new(LocalSource::new(
                Box::new(Sps30::new(hal, addr)),
                clock,
                Duration::from_secs(sps30.settle_seconds),
                sps30.max_valid_value,
            ))
        }
        ParticulateSource::Remote => {
            let remote = config
                .sensors
                .remote
                .as_ref()
                .context("sensors.remote is required for a remote source")?;
            Box::new(RemoteSource::new(feed, clock, remote.max_age_seconds, sps30.max_valid_value))
        }
    };
    Ok(source)
}

async fn build_environment(config: &MonitorConfig, hal: Arc<dyn HardwareProvider>) -> EnvironmentProbe {
    let climate: Option<Box<dyn ClimateSensor>> = config
        .sensors
        .bme280
        .as_ref()
        .and_then(|c| parse_i2c_address(&c.i2c_address).ok())
        .map(|addr| Box::new(Bme280::new(hal.clone(), addr)) as Box<dyn ClimateSensor>);

    let pressure: Option<Box<dyn PressureSensor>> = match config
        .sensors
        .sdp810
        .as_ref()
        .and_then(|c| parse_i2c_address(&c.i2c_address).ok())
    {
        Some(addr) => match tokio::task::spawn_blocking(move || Sdp810::start(hal, addr)).await {
            Ok(Ok(sdp)) => Some(Box::new(sdp) as Box<dyn PressureSensor>),
            Ok(Err(e)) => {
                tracing::warn!("[ENV] SDP810 unavailable: {}", e);
                None
            }
            Err(e) => {
                tracing::warn!("[ENV] SDP810 start task failed: {}", e);
                None
            }
        },
        None => None,
    };

    EnvironmentProbe::new(climate, pressure)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("[SHUTDOWN] ctrl-c handler failed: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("[SHUTDOWN] SIGTERM handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
