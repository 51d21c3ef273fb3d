//! SQLite backend. One connection behind a mutex; every append is its own
//! autocommit statement, so it is on disk when `execute` returns.

use super::migrations::run_migrations;
use super::{cutoff, AuditStore, BaselineStore, HistoryStore};
use crate::domain::{BaselineRecord, EdgeDecision, Reading};
use crate::error::StorageError;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StorageError> {
        run_migrations(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// decisions table row before the enum columns are parsed
struct DecisionRow {
    timestamp: i64,
    tier: String,
    relay_pin: i64,
    reading_value: f64,
    baseline_value: f64,
    threshold_ratio: f64,
    relay_state: String,
    detection_state: String,
    window_size_used: i64,
    window_valid: bool,
    override_applied: Option<String>,
}

impl TryFrom<DecisionRow> for EdgeDecision {
    type Error = StorageError;

    fn try_from(row: DecisionRow) -> Result<Self, Self::Error> {
        Ok(EdgeDecision {
            timestamp: row.timestamp,
            tier: row.tier,
            relay_pin: u8::try_from(row.relay_pin)
                .map_err(|_| StorageError::Corrupt(format!("relay pin {}", row.relay_pin)))?,
            reading_value: row.reading_value,
            baseline_value: row.baseline_value,
            threshold_ratio: row.threshold_ratio,
            relay_state: row.relay_state.parse().map_err(StorageError::Corrupt)?,
            detection_state: row.detection_state.parse().map_err(StorageError::Corrupt)?,
            window_size_used: usize::try_from(row.window_size_used)
                .map_err(|_| StorageError::Corrupt(format!("window size {}", row.window_size_used)))?,
            window_valid: row.window_valid,
            override_applied: row
                .override_applied
                .map(|o| o.parse())
                .transpose()
                .map_err(StorageError::Corrupt)?,
        })
    }
}

impl HistoryStore for SqliteStore {
    fn append_reading(&self, reading: &Reading) -> Result<(), StorageError> {
        self.conn()?.execute(
            "INSERT INTO readings (timestamp, value) VALUES (?1, ?2)",
            params![reading.timestamp, reading.value],
        )?;
        Ok(())
    }

    fn last_n(&self, n: usize) -> Result<Vec<Reading>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, value FROM readings ORDER BY id DESC LIMIT ?1",
        )?;
        let mut rows = stmt
            .query_map(params![limit(n)], |row| Ok(Reading::new(row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    fn since(&self, now: i64, duration_secs: u64) -> Result<Vec<Reading>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, value FROM readings WHERE timestamp >= ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![cutoff(now, duration_secs)], |row| {
                Ok(Reading::new(row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl BaselineStore for SqliteStore {
    fn record_baseline(&self, record: &BaselineRecord) -> Result<(), StorageError> {
        self.conn()?.execute(
            "INSERT INTO baselines (computed_at, candidate, value, rejected) VALUES (?1, ?2, ?3, ?4)",
            params![record.computed_at, record.candidate, record.value, record.rejected],
        )?;
        Ok(())
    }

    fn recent_baselines(&self, k: usize) -> Result<Vec<BaselineRecord>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT computed_at, candidate, value, rejected FROM baselines ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit(k)], |row| {
                Ok(BaselineRecord {
                    computed_at: row.get(0)?,
                    candidate: row.get(1)?,
                    value: row.get(2)?,
                    rejected: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn latest_baseline(&self) -> Result<Option<BaselineRecord>, StorageError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT computed_at, candidate, value, rejected FROM baselines ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(BaselineRecord {
                        computed_at: row.get(0)?,
                        candidate: row.get(1)?,
                        value: row.get(2)?,
                        rejected: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

impl AuditStore for SqliteStore {
    fn record_decision(&self, d: &EdgeDecision) -> Result<(), StorageError> {
        self.conn()?.execute(
            "INSERT INTO decisions (
                timestamp,
                tier,
                relay_pin,
                reading_value,
                baseline_value,
                threshold_ratio,
                relay_state,
                detection_state,
                window_size_used,
                window_valid,
                override_applied
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                d.timestamp,
                d.tier,
                d.relay_pin,
                d.reading_value,
                d.baseline_value,
                d.threshold_ratio,
                d.relay_state.as_str(),
                d.detection_state.as_str(),
                limit(d.window_size_used),
                d.window_valid,
                d.override_applied.map(|o| o.as_str()),
            ],
        )?;
        Ok(())
    }

    fn recent_decisions(&self, n: usize) -> Result<Vec<EdgeDecision>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT
                timestamp,
                tier,
                relay_pin,
                reading_value,
                baseline_value,
                threshold_ratio,
                relay_state,
                detection_state,
                window_size_used,
                window_valid,
                override_applied
            FROM decisions
            ORDER BY id DESC
            LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit(n)], |row| {
                Ok(DecisionRow {
                    timestamp: row.get(0)?,
                    tier: row.get(1)?,
                    relay_pin: row.get(2)?,
                    reading_value: row.get(3)?,
                    baseline_value: row.get(4)?,
                    threshold_ratio: row.get(5)?,
                    relay_state: row.get(6)?,
                    detection_state: row.get(7)?,
                    window_size_used: row.get(8)?,
                    window_valid: row.get(9)?,
                    override_applied: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(EdgeDecision::try_from).collect()
    }
}
