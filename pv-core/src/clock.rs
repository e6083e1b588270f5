//! Clocks used to stamp store mutations.
//!
//! Every device stamps writes with the same kind of clock: the local wall
//! clock corrected by an offset measured against a trusted time source.
//! The offset starts at zero and is only ever replaced by a newer
//! measurement, so the source of truth never silently changes.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Source of logical timestamps, in whole seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current time in seconds since the epoch.
    fn now(&self) -> i64;
}

/// Uncorrected local wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Wall clock plus an offset calibrated against trusted time.
#[derive(Debug, Default)]
pub struct OffsetClock {
    offset_secs: AtomicI64,
}

impl OffsetClock {
    /// Create a clock with no correction applied yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a trusted reading taken at local time `local_now`.
    pub fn calibrate(&self, trusted_now: i64, local_now: i64) {
        let offset = trusted_now - local_now;
        let previous = self.offset_secs.swap(offset, Ordering::Relaxed);
        if previous != offset {
            debug!("clock offset recalibrated: {previous}s -> {offset}s");
        }
    }

    /// Current correction in seconds.
    pub fn offset(&self) -> i64 {
        self.offset_secs.load(Ordering::Relaxed)
    }
}

impl Clock for OffsetClock {
    fn now(&self) -> i64 {
        SystemClock.now() + self.offset()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> i64 {
        (**self).now()
    }
}

/// Test clock that returns whatever it was last set to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self { now: AtomicI64::new(now) }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_clock_applies_calibration() {
        let clock = OffsetClock::new();
        assert_eq!(clock.offset(), 0);
        clock.calibrate(1_000, 940);
        assert_eq!(clock.offset(), 60);
        let drift = clock.now() - SystemClock.now();
        assert!((59..=61).contains(&drift));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(5);
        assert_eq!(clock.now(), 105);
        clock.set(7);
        assert_eq!(clock.now(), 7);
    }

    #[test]
    fn test_arc_clock_delegates() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(42));
        assert_eq!(clock.now(), 42);
    }
}
