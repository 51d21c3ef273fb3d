use super::{cutoff, AuditStore, BaselineStore, HistoryStore};
use crate::config::MonitorConfig;
use crate::domain::{BaselineRecord, EdgeDecision, Reading};
use crate::error::StorageError;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// How many records of each kind are kept; older ones are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub readings: usize,
    pub baselines: usize,
    pub decisions: usize,
}

impl Retention {
    pub const UNBOUNDED: Retention = Retention {
        readings: usize::MAX,
        baselines: usize::MAX,
        decisions: usize::MAX,
    };

    /// Enough for every query the monitor makes: the detection window or
    /// the calibration window for readings, K candidates for baselines,
    /// and a window's worth of cycles for decisions.
    pub fn for_config(config: &MonitorConfig) -> Self {
        let window = config.detection.window_size.max(1);
        let per_poll = config.polling.interval_seconds.max(1);
        let calibration = match config.baseline.calibration_samples {
            Some(n) => n,
            None => usize::try_from(config.baseline.calibration_seconds.div_ceil(per_poll))
                .unwrap_or(usize::MAX)
                .saturating_add(1),
        };
        let tiers = config.detection.tiers.len().max(1);
        Self {
            readings: window.max(calibration),
            baselines: config.baseline.candidate_count.max(1),
            decisions: tiers.saturating_mul(window),
        }
    }
}

#[derive(Default)]
struct Records {
    readings: VecDeque<Reading>,
    baselines: VecDeque<BaselineRecord>,
    decisions: VecDeque<EdgeDecision>,
}

/// Process-local store. Nothing survives a restart.
pub struct MemoryStore {
    records: Mutex<Records>,
    retention: Retention,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::bounded(Retention::UNBOUNDED)
    }

    pub fn bounded(retention: Retention) -> Self {
        Self { records: Mutex::new(Records::default()), retention }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Records>, StorageError> {
        self.records.lock().map_err(|_| StorageError::Poisoned)
    }
}

fn push_bounded<T>(items: &mut VecDeque<T>, item: T, cap: usize) {
    items.push_back(item);
    while items.len() > cap {
        items.pop_front();
    }
}

fn newest_first<T: Clone>(items: &VecDeque<T>, n: usize) -> Vec<T> {
    items.iter().rev().take(n).cloned().collect()
}

impl HistoryStore for MemoryStore {
    fn append_reading(&self, reading: &Reading) -> Result<(), StorageError> {
        push_bounded(&mut self.lock()?.readings, *reading, self.retention.readings);
        Ok(())
    }

    fn last_n(&self, n: usize) -> Result<Vec<Reading>, StorageError> {
        let records = self.lock()?;
        let start = records.readings.len().saturating_sub(n);
        Ok(records.readings.iter().skip(start).copied().collect())
    }

    fn since(&self, now: i64, duration_secs: u64) -> Result<Vec<Reading>, StorageError> {
        let from = cutoff(now, duration_secs);
        Ok(self.lock()?.readings.iter().filter(|r| r.timestamp >= from).copied().collect())
    }
}

impl BaselineStore for MemoryStore {
    fn record_baseline(&self, record: &BaselineRecord) -> Result<(), StorageError> {
        push_bounded(&mut self.lock()?.baselines, *record, self.retention.baselines);
        Ok(())
    }

    fn recent_baselines(&self, k: usize) -> Result<Vec<BaselineRecord>, StorageError> {
        Ok(newest_first(&self.lock()?.baselines, k))
    }
}

impl AuditStore for MemoryStore {
    fn record_decision(&self, decision: &EdgeDecision) -> Result<(), StorageError> {
        push_bounded(&mut self.lock()?.decisions, decision.clone(), self.retention.decisions);
        Ok(())
    }

    fn recent_decisions(&self, n: usize) -> Result<Vec<EdgeDecision>, StorageError> {
        Ok(newest_first(&self.lock()?.decisions, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RelayState;
    use crate::store::conformance;

    #[test]
    fn history_queries() {
        conformance::history_queries(&MemoryStore::new());
    }

    #[test]
    fn append_order_is_kept() {
        conformance::append_order_is_kept(&MemoryStore::new());
    }

    #[test]
    fn baselines_newest_first() {
        conformance::baselines_newest_first(&MemoryStore::new());
    }

    #[test]
    fn decisions_newest_first() {
        conformance::decisions_newest_first(&MemoryStore::new());
    }

    #[test]
    fn bounded_store_drops_oldest_records() {
        let store = MemoryStore::bounded(Retention { readings: 3, baselines: 1, decisions: 2 });
        for i in 0..10 {
            store.append_reading(&Reading::new(i, i as f64)).unwrap();
            store.record_decision(&conformance::decision(i, "filter", RelayState::Off)).unwrap();
        }
        let values: Vec<f64> = store.last_n(10).unwrap().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![7.0, 8.0, 9.0]);
        assert_eq!(store.recent_decisions(10).unwrap().len(), 2);
        assert_eq!(store.recent_decisions(1).unwrap()[0].timestamp, 9);

        conformance::baselines_newest_first(&MemoryStore::bounded(Retention { baselines: 2, ..Retention::UNBOUNDED }));
    }

    #[test]
    fn retention_covers_detection_and_calibration_windows() {
        let mut config = MonitorConfig::default();
        // 20-sample window, 1800 s calibration at 60 s polling
        let r = Retention::for_config(&config);
        assert_eq!(r.readings, 31);
        assert_eq!(r.baselines, 5);
        assert_eq!(r.decisions, 20);

        config.baseline.calibration_samples = Some(120);
        assert_eq!(Retention::for_config(&config).readings, 120);
    }
}
