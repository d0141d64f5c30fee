//! Wall-clock abstraction used by the windowed operators.
//!
//! Window boundaries are computed against a [`Clock`] so that tests can drive
//! time explicitly instead of sleeping past real window edges.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, UTC.
pub type Timestamp = i64;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A clock advanced by hand. Cloning yields a handle to the same instant.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn at(start: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Largest window start not greater than `now` on a grid of `size_ms` starting
/// at the epoch. `now` may be negative (clocks stepped before the epoch).
pub(crate) fn floor_to(now: Timestamp, size_ms: i64) -> Timestamp {
    let rem = now.rem_euclid(size_ms);
    now - rem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_alignment() {
        assert_eq!(floor_to(0, 1000), 0);
        assert_eq!(floor_to(999, 1000), 0);
        assert_eq!(floor_to(1000, 1000), 1000);
        assert_eq!(floor_to(1500, 1000), 1000);
        assert_eq!(floor_to(-1, 1000), -1000);
    }
}
