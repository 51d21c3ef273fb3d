//! ==============================================================================
//! messaging.rs - publish/subscribe transport
//! ==============================================================================
//!
//! purpose:
//!     fire-and-forget publishing of decisions, plus topic subscriptions for
//!     operator commands and satellite readings.
//!
//! implementations:
//!     - MqttBus: rumqttc client; a background task drives the event loop,
//!       re-subscribes after every reconnect, and dispatches incoming
//!       publishes to the registered handlers.
//!     - LocalBus: in-process, used when no broker is configured and in tests.
//!
//! ==============================================================================

use crate::config::MqttConfig;
use crate::domain::{EdgeDecision, Environment, RelayState};
use crate::error::MessagingError;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type Handler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

pub trait MessageBus: Send + Sync {
    /// never blocks; delivery is best-effort
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), MessagingError>;
    fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), MessagingError>;
}

/// Decision payload as published for downstream consumers.
#[derive(Debug, Serialize, PartialEq)]
pub struct DecisionMessage<'a> {
    pub timestamp: i64,
    pub value: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub baseline: f64,
    pub tier: &'a str,
    pub relay_state: RelayState,
}

impl<'a> DecisionMessage<'a> {
    pub fn new(decision: &'a EdgeDecision, env: &Environment) -> Self {
        Self {
            timestamp: decision.timestamp,
            value: decision.reading_value,
            temperature: env.temperature,
            humidity: env.humidity,
            pressure: env.pressure,
            baseline: decision.baseline_value,
            tier: &decision.tier,
            relay_state: decision.relay_state,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        Ok(serde_json::to_vec(self)?)
    }
}

type HandlerTable = Arc<RwLock<HashMap<String, Vec<Handler>>>>;

fn dispatch(handlers: &HandlerTable, topic: &str, payload: &[u8]) {
    let matched: Vec<Handler> = handlers
        .read()
        .map(|h| h.get(topic).cloned().unwrap_or_default())
        .unwrap_or_default();
    for handler in matched {
        handler(topic, payload);
    }
}

fn register(handlers: &HandlerTable, topic: &str, handler: Handler) -> Result<(), MessagingError> {
    handlers
        .write()
        .map_err(|_| MessagingError::Subscribe { topic: topic.to_string(), reason: "handler table poisoned".into() })?
        .entry(topic.to_string())
        .or_default()
        .push(handler);
    Ok(())
}

// ==============================================================================
// mqtt
// ==============================================================================

pub struct MqttBus {
    client: AsyncClient,
    handlers: HandlerTable,
}

impl MqttBus {
    /// Creates the client and spawns its event loop. The loop exits when
    /// `cancel` fires.
    pub fn connect(config: &MqttConfig, cancel: CancellationToken) -> (Arc<Self>, JoinHandle<()>) {
        let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let handlers: HandlerTable = Arc::new(RwLock::new(HashMap::new()));
        let bus = Arc::new(Self { client: client.clone(), handlers: handlers.clone() });

        tracing::info!("[MQTT] connecting to {}:{} as '{}'", config.broker, config.port, config.client_id);
        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("[MQTT] connected");
                        let topics: Vec<String> = handlers
                            .read()
                            .map(|h| h.keys().cloned().collect())
                            .unwrap_or_default();
                        for topic in topics {
                            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                tracing::warn!("[MQTT] resubscribe to '{}' failed: {}", topic, e);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        dispatch(&handlers, &publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("[MQTT] connection error: {} - retrying in 5s", e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        }
                    }
                }
            }
            if let Err(e) = client.try_disconnect() {
                tracing::debug!("[MQTT] disconnect: {}", e);
            }
            tracing::info!("[MQTT] event loop stopped");
        });

        (bus, task)
    }
}

impl MessageBus for MqttBus {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), MessagingError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| MessagingError::Publish { topic: topic.to_string(), reason: e.to_string() })
    }

    fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), MessagingError> {
        register(&self.handlers, topic, handler)?;
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| MessagingError::Subscribe { topic: topic.to_string(), reason: e.to_string() })
    }
}

// ==============================================================================
// in-process
// ==============================================================================

/// Loops published messages back to local subscribers and keeps a copy.
#[derive(Default)]
pub struct LocalBus {
    handlers: HandlerTable,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// everything published so far, oldest-first
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), MessagingError> {
        if let Ok(mut p) = self.published.lock() {
            p.push((topic.to_string(), payload.to_vec()));
        }
        dispatch(&self.handlers, topic, payload);
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), MessagingError> {
        register(&self.handlers, topic, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DetectionState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn decision_payload_shape() {
        let decision = EdgeDecision {
            timestamp: 1_700_000_000,
            tier: "t20".into(),
            relay_pin: 26,
            reading_value: 14.0,
            baseline_value: 10.0,
            threshold_ratio: 0.2,
            relay_state: RelayState::On,
            detection_state: DetectionState::AboveThreshold,
            window_size_used: 10,
            window_valid: true,
            override_applied: None,
        };
        let env = Environment { temperature: Some(71.6), humidity: Some(40.0), pressure: None };
        let bytes = DecisionMessage::new(&decision, &env).to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["value"], 14.0);
        assert_eq!(json["baseline"], 10.0);
        assert_eq!(json["tier"], "t20");
        assert_eq!(json["relay_state"], "ON");
        assert_eq!(json["temperature"], 71.6);
        assert!(json["pressure"].is_null());
    }

    #[test]
    fn local_bus_routes_by_exact_topic() {
        let bus = LocalBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.subscribe("EmergencyShutoff", Arc::new(move |_: &str, payload: &[u8]| {
            assert_eq!(payload, b"STOP");
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        bus.publish("EmergencyShutoff", b"STOP").unwrap();
        bus.publish("pm25/decisions", b"{}").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.published().len(), 2);
    }
}
