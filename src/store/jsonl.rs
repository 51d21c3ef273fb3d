//! JSON-lines backend: one file per record set under a data directory.
//!
//! Each append is a single `write_all` of one line followed by `sync_data`,
//! so a crash loses at most the line being written. A torn or hand-edited
//! line is skipped with a warning on read rather than failing the query.
//!
//! Queries only want the newest records, so they walk the file backwards
//! in fixed-size chunks from the end and stop once they have enough. The
//! cost of a query follows its result size, not the age of the file.

use super::{cutoff, AuditStore, BaselineStore, HistoryStore};
use crate::domain::{BaselineRecord, EdgeDecision, Reading};
use crate::error::StorageError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const READINGS: &str = "readings.jsonl";
const BASELINES: &str = "baselines.jsonl";
const DECISIONS: &str = "decisions.jsonl";

const CHUNK: u64 = 8 * 1024;
/// `since` keeps scanning this far past the cutoff, so readings appended
/// slightly out of time order are still found
const SINCE_SKEW_SECS: i64 = 3600;

pub struct JsonlStore {
    dir: PathBuf,
    io: Mutex<()>,
}

impl JsonlStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, io: Mutex::new(()) })
    }

    fn append<T: Serialize>(&self, file: &str, record: &T) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let _guard = self.io.lock().map_err(|_| StorageError::Poisoned)?;
        let mut f = OpenOptions::new().create(true).append(true).open(self.dir.join(file))?;
        f.write_all(&line)?;
        f.sync_data()?;
        Ok(())
    }

    /// Feeds parseable records to `visit` newest-first until it returns false
    /// or the start of the file is reached.
    fn scan_back<T: DeserializeOwned>(
        &self,
        file: &str,
        mut visit: impl FnMut(T) -> bool,
    ) -> Result<(), StorageError> {
        let path = self.dir.join(file);
        let _guard = self.io.lock().map_err(|_| StorageError::Poisoned)?;
        let mut f = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut pos = f.metadata()?.len();
        // bytes before the earliest newline seen so far: a line whose start
        // lies in an earlier chunk
        let mut head: Vec<u8> = Vec::new();
        while pos > 0 {
            let len = CHUNK.min(pos);
            pos -= len;
            f.seek(SeekFrom::Start(pos))?;
            let mut buf = vec![0u8; len as usize];
            f.read_exact(&mut buf)?;
            buf.extend_from_slice(&head);

            let Some(first_newline) = buf.iter().position(|b| *b == b'\n') else {
                head = buf;
                continue;
            };
            head = buf[..first_newline].to_vec();
            for line in buf[first_newline + 1..].split(|b| *b == b'\n').rev() {
                if !feed(line, &path, &mut visit) {
                    return Ok(());
                }
            }
        }
        feed(&head, &path, &mut visit);
        Ok(())
    }
}

/// false once `visit` wants no more
fn feed<T: DeserializeOwned>(line: &[u8], path: &Path, visit: &mut impl FnMut(T) -> bool) -> bool {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return true;
    }
    match serde_json::from_slice(line) {
        Ok(record) => visit(record),
        Err(e) => {
            tracing::warn!("[STORE] skipping corrupt line in {}: {}", path.display(), e);
            true
        }
    }
}

/// up to `n` newest records, newest-first
fn newest<T: DeserializeOwned>(store: &JsonlStore, file: &str, n: usize) -> Result<Vec<T>, StorageError> {
    let mut out = Vec::new();
    if n == 0 {
        return Ok(out);
    }
    store.scan_back(file, |record: T| {
        out.push(record);
        out.len() < n
    })?;
    Ok(out)
}

impl HistoryStore for JsonlStore {
    fn append_reading(&self, reading: &Reading) -> Result<(), StorageError> {
        self.append(READINGS, reading)
    }

    fn last_n(&self, n: usize) -> Result<Vec<Reading>, StorageError> {
        let mut readings: Vec<Reading> = newest(self, READINGS, n)?;
        readings.reverse();
        Ok(readings)
    }

    fn since(&self, now: i64, duration_secs: u64) -> Result<Vec<Reading>, StorageError> {
        let from = cutoff(now, duration_secs);
        let stop_below = from.saturating_sub(SINCE_SKEW_SECS);
        let mut readings = Vec::new();
        self.scan_back(READINGS, |r: Reading| {
            if r.timestamp >= from {
                readings.push(r);
            }
            r.timestamp >= stop_below
        })?;
        readings.reverse();
        Ok(readings)
    }
}

impl BaselineStore for JsonlStore {
    fn record_baseline(&self, record: &BaselineRecord) -> Result<(), StorageError> {
        self.append(BASELINES, record)
    }

    fn recent_baselines(&self, k: usize) -> Result<Vec<BaselineRecord>, StorageError> {
        newest(self, BASELINES, k)
    }
}

impl AuditStore for JsonlStore {
    fn record_decision(&self, decision: &EdgeDecision) -> Result<(), StorageError> {
        self.append(DECISIONS, decision)
    }

    fn recent_decisions(&self, n: usize) -> Result<Vec<EdgeDecision>, StorageError> {
        newest(self, DECISIONS, n)
    }
}
