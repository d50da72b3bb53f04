//! Time source for due-date comparisons and timeout detection.
//! Injected everywhere so tests can move time by hand.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

/// Wall-clock provider.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
///
/// Reads wall-clock time, so timeouts compare against timestamps that other
/// replicas wrote; keep hosts NTP-synced. Readings never go backwards within
/// one process: a step back repeats the last reading until the wall clock
/// catches up.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_ms: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn clamp(&self, wall_ms: i64) -> i64 {
        let prev = self.last_ms.fetch_max(wall_ms, Ordering::AcqRel);
        prev.max(wall_ms)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let ms = self.clamp(now.timestamp_millis());
        DateTime::from_timestamp_millis(ms).unwrap_or(now)
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(truncate_ms(start)),
        }
    }

    /// Start at the Unix epoch; handy for scenario tests written as `t=0`, `t=30000`.
    pub fn at_epoch() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = truncate_ms(at);
    }

    pub fn advance_ms(&self, ms: i64) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += chrono::Duration::milliseconds(ms);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Drop sub-millisecond precision; the store keeps timestamps as epoch millis.
pub fn truncate_ms(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}
