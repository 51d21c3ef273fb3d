//! ==============================================================================
//! baseline.rs - adaptive reference level
//! ==============================================================================
//!
//! purpose:
//!     turns a calibration window of readings into the baseline the detector
//!     compares against, rejecting windows polluted by a transient event.
//!
//! selection rule (priors are earlier raw candidates, newest-first):
//!
//! ```text
//!     candidate <= factor x mean(priors)  ->  accept candidate
//!     otherwise                           ->  first prior that is itself
//!                                             <= factor x its older neighbour
//!                                             (oldest prior vs the mean)
//!     no prior qualifies                  ->  floor
//!
//!     the result is always clamped to >= floor.
//! ```
//!
//! relationships:
//!     - driven by: monitor.rs baseline loop (sole writer of baselines)
//!     - reads: store (readings, prior baselines, latest decisions)
//!
//! ==============================================================================

use crate::clock::Clock;
use crate::config::BaselineConfig;
use crate::domain::{Baseline, BaselineRecord};
use crate::error::StorageError;
use crate::store::Store;
use std::sync::Arc;

/// Outcome of applying the outlier rule to one candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub value: f64,
    pub rejected: bool,
}

/// Picks the baseline for `candidate` given prior candidates (newest-first).
pub fn select(candidate: f64, priors: &[f64], floor: f64, outlier_factor: f64) -> Selection {
    if priors.is_empty() {
        return Selection { value: candidate.max(floor), rejected: false };
    }

    let average = priors.iter().sum::<f64>() / priors.len() as f64;
    if candidate <= outlier_factor * average {
        return Selection { value: candidate.max(floor), rejected: false };
    }

    let fallback = priors.iter().enumerate().find_map(|(i, &prior)| {
        let neighbour = priors.get(i + 1).copied().unwrap_or(average);
        (prior <= outlier_factor * neighbour).then_some(prior)
    });

    Selection { value: fallback.unwrap_or(floor).max(floor), rejected: true }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// a relay is running, so the air being sampled is filtered
    RelayActive,
    /// nothing recorded inside the calibration window
    NoReadings,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// new record persisted
    Updated(BaselineRecord),
    /// current baseline stays as it is, nothing persisted
    Unchanged(SkipReason),
    /// storage failed; the detector should use the floor
    StorageFallback(f64),
}

impl RefreshOutcome {
    /// baseline to cache, if this outcome replaces the current one
    pub fn baseline(&self, now: i64) -> Option<Baseline> {
        match self {
            RefreshOutcome::Updated(record) => Some(record.baseline()),
            RefreshOutcome::StorageFallback(floor) => Some(Baseline { value: *floor, computed_at: now }),
            RefreshOutcome::Unchanged(_) => None,
        }
    }
}

pub struct BaselineEstimator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: BaselineConfig,
    /// decisions written per detection cycle; the latest cycle is this many rows
    tier_count: usize,
}

impl BaselineEstimator {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        config: BaselineConfig,
        tier_count: usize,
    ) -> Self {
        Self { store, clock, config, tier_count }
    }

    pub fn floor(&self) -> f64 {
        self.config.floor
    }

    /// Baseline for a cold start: the last persisted one, else the floor.
    pub fn initial(&self) -> Baseline {
        match self.store.latest_baseline() {
            Ok(Some(record)) => record.baseline(),
            Ok(None) => Baseline { value: self.config.floor, computed_at: self.clock.now() },
            Err(e) => {
                tracing::warn!("[BASELINE] could not load persisted baseline ({}), using floor", e);
                Baseline { value: self.config.floor, computed_at: self.clock.now() }
            }
        }
    }

    /// One refresh. Never fails: storage trouble degrades to the floor.
    pub fn refresh(&self) -> RefreshOutcome {
        match self.try_refresh() {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("[BASELINE] storage unavailable during refresh: {} - falling back to floor {}", e, self.config.floor);
                RefreshOutcome::StorageFallback(self.config.floor)
            }
        }
    }

    fn try_refresh(&self) -> Result<RefreshOutcome, StorageError> {
        let now = self.clock.now();

        if self.config.skip_while_relay_on && self.relay_active()? {
            tracing::info!("[BASELINE] relay is ON - skipping calibration");
            return Ok(RefreshOutcome::Unchanged(SkipReason::RelayActive));
        }

        let readings = match self.config.calibration_samples {
            Some(n) => self.store.last_n(n)?,
            None => self.store.since(now, self.config.calibration_seconds)?,
        };
        if readings.is_empty() {
            tracing::warn!("[BASELINE] no readings in calibration window - keeping current baseline");
            return Ok(RefreshOutcome::Unchanged(SkipReason::NoReadings));
        }
        let candidate = readings.iter().map(|r| r.value).sum::<f64>() / readings.len() as f64;

        let priors: Vec<f64> = self
            .store
            .recent_baselines(self.config.candidate_count.saturating_sub(1))?
            .iter()
            .map(|b| b.candidate)
            .collect();

        let selection = select(candidate, &priors, self.config.floor, self.config.outlier_factor);
        if selection.rejected {
            tracing::warn!(
                "[BASELINE] candidate {:.2} rejected as outlier against {:?}, using {:.2}",
                candidate,
                priors,
                selection.value
            );
        }

        let record = BaselineRecord {
            computed_at: now,
            candidate,
            value: selection.value,
            rejected: selection.rejected,
        };
        self.store.record_baseline(&record)?;
        tracing::info!(
            "[BASELINE] {:.2} µg/m³ from {} readings (candidate {:.2})",
            record.value,
            readings.len(),
            candidate
        );
        Ok(RefreshOutcome::Updated(record))
    }

    fn relay_active(&self) -> Result<bool, StorageError> {
        Ok(self
            .store
            .recent_decisions(self.tier_count)?
            .iter()
            .any(|d| d.relay_state.is_on()))
    }
}
