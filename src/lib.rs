//! ==============================================================================
//! pm_edge_host - PM2.5 rising-edge relay host
//! ==============================================================================
//!
//! samples particulate concentration, keeps a rolling history, maintains an
//! adaptive baseline, and switches a filter relay when a full window of
//! recent readings sits above `baseline * (1 + ratio)`.
//!
//! module map:
//!     domain      records shared by everything (Reading, EdgeDecision, ...)
//!     error       typed failure taxonomy
//!     config      monitor.toml schema + validation
//!     clock       wall-clock capability
//!     sensirion   SPS30 / SDP810 frame codecs
//!     hal         hardware access (mock or rppal) and device drivers
//!     source      validated readings from local or remote sensors
//!     store       readings / baselines / decisions persistence
//!     baseline    baseline estimator
//!     detector    edge decision engine + blackout window
//!     overrides   emergency stop / manual on
//!     messaging   mqtt publish/subscribe
//!     actuation   relay + audit + publish sink
//!     monitor     detection and baseline loops
//!     api         json status / override endpoints
//!     telemetry   tracing setup
//!
//! ==============================================================================

pub mod actuation;
pub mod api;
pub mod baseline;
pub mod clock;
pub mod config;
pub mod detector;
pub mod domain;
pub mod error;
pub mod hal;
pub mod messaging;
pub mod monitor;
pub mod overrides;
pub mod sensirion;
pub mod source;
pub mod store;
pub mod telemetry;
