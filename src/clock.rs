//! Wall-clock capability. Detection and baseline code ask the clock instead
//! of reading system time directly so cycles can be replayed in tests.

use chrono::{Local, NaiveTime, TimeZone};
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync {
    /// seconds since unix epoch
    fn now(&self) -> i64;
    /// local time of day, for the blackout window
    fn local_time(&self) -> NaiveTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn local_time(&self) -> NaiveTime {
        Local::now().time()
    }
}

/// Settable clock. Local time is derived from the epoch value in UTC.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self { now: AtomicI64::new(start) }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn local_time(&self) -> NaiveTime {
        let secs = self.now();
        chrono::Utc
            .timestamp_opt(secs, 0)
            .single()
            .map(|dt| dt.time())
            .unwrap_or(NaiveTime::MIN)
    }
}
