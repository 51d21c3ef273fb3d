//! ==============================================================================
//! store - durable record sets: readings, baselines, decisions
//! ==============================================================================
//!
//! purpose:
//!     append-only, time-ordered storage behind three small traits so the
//!     detection core never knows which backend it is writing to.
//!
//! backends (picked by `[storage].backend`):
//!     - memory   tests, dry runs and fallback; bounded, lost on exit
//!     - jsonl    one JSON object per line, fsync per append
//!     - sqlite   rusqlite, schema migrations keyed on `user_version`
//!
//! ordering:
//!     readings come back oldest-first, in append order. baselines and
//!     decisions come back newest-first, which is how their readers walk them.
//!
//! every backend serializes access internally; the stores are Send + Sync
//! and shared between the detection and baseline loops behind an Arc.
//!
//! ==============================================================================

mod jsonl;
mod memory;
mod migrations;
mod sqlite;

pub use jsonl::JsonlStore;
pub use memory::{MemoryStore, Retention};
pub use sqlite::SqliteStore;

use crate::config::{StorageBackend, StorageConfig};
use crate::domain::{BaselineRecord, EdgeDecision, Reading};
use crate::error::StorageError;
use std::sync::Arc;

pub trait HistoryStore: Send + Sync {
    /// durable before return
    fn append_reading(&self, reading: &Reading) -> Result<(), StorageError>;

    /// up to `n` most recent readings, oldest-first. never pads.
    fn last_n(&self, n: usize) -> Result<Vec<Reading>, StorageError>;

    /// readings with `timestamp >= now - duration_secs`, oldest-first
    fn since(&self, now: i64, duration_secs: u64) -> Result<Vec<Reading>, StorageError>;
}

pub trait BaselineStore: Send + Sync {
    fn record_baseline(&self, record: &BaselineRecord) -> Result<(), StorageError>;

    /// up to `k` most recent records, newest-first
    fn recent_baselines(&self, k: usize) -> Result<Vec<BaselineRecord>, StorageError>;

    fn latest_baseline(&self) -> Result<Option<BaselineRecord>, StorageError> {
        Ok(self.recent_baselines(1)?.into_iter().next())
    }
}

pub trait AuditStore: Send + Sync {
    fn record_decision(&self, decision: &EdgeDecision) -> Result<(), StorageError>;

    /// up to `n` most recent decisions, newest-first
    fn recent_decisions(&self, n: usize) -> Result<Vec<EdgeDecision>, StorageError>;
}

pub trait Store: HistoryStore + BaselineStore + AuditStore {}

impl<T: HistoryStore + BaselineStore + AuditStore> Store for T {}

pub fn open_store(config: &StorageConfig, retention: Retention) -> Result<Arc<dyn Store>, StorageError> {
    let store: Arc<dyn Store> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::bounded(retention)),
        StorageBackend::Jsonl => Arc::new(JsonlStore::open(&config.path)?),
        StorageBackend::Sqlite => Arc::new(SqliteStore::open(&config.path)?),
    };
    tracing::info!("[STORE] {:?} backend at {}", config.backend, config.path.display());
    Ok(store)
}

/// `timestamp` threshold for a trailing-duration query
pub(crate) fn cutoff(now: i64, duration_secs: u64) -> i64 {
    now.saturating_sub(i64::try_from(duration_secs).unwrap_or(i64::MAX))
}
