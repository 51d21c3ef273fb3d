//! ==============================================================================
//! error.rs - typed failure taxonomy for the detection core
//! ==============================================================================
//!
//! purpose:
//!     every steady-state failure is isolated to a single cycle. the type of
//!     the error decides what the loop does with it:
//!
//! ```text
//!     ┌──────────────────┬──────────────────────────────────────────────┐
//!     │ SensorError      │ skip this cycle, record nothing              │
//!     │ StorageError     │ append: log + continue / query: degrade      │
//!     │ ActuationError   │ log, next cycle re-commands the relay        │
//!     │ MessagingError   │ log only (fire-and-forget)                   │
//!     │ ConfigError      │ fatal, startup only                          │
//!     └──────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! ==============================================================================

use thiserror::Error;

/// Transient failure reading a sensor. The cycle is skipped.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SensorError {
    #[error("sensor did not respond: {0}")]
    NoResponse(String),

    #[error("sensor returned no value")]
    NullReading,

    #[error("value {value} outside valid range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    #[error("sensor reported invalid-range sentinel {0}")]
    Sentinel(f64),

    #[error("latest remote reading is {age_secs}s old (limit {limit_secs}s)")]
    Stale { age_secs: i64, limit_secs: u64 },

    #[error("sensor frame checksum mismatch at byte {0}")]
    Checksum(usize),

    #[error("sensor not started")]
    NotStarted,
}

/// Storage collaborator failure.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Relay hardware write failure.
#[derive(Debug, Error)]
#[error("relay on pin {pin} could not be set {state}: {reason}")]
pub struct ActuationError {
    pub pin: u8,
    pub state: crate::domain::RelayState,
    pub reason: String,
}

/// Messaging transport failure.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Invalid or unreadable configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}
