//! Monotonic nanosecond clock.
//!
//! The tcache GC spaces batched passes by wall time, so the runtime holds a
//! `dyn Clock`. Production code uses [`MonotonicClock`]; tests drive
//! [`ManualClock`] by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub const NSEC_PER_MSEC: u64 = 1_000_000;
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Source of monotonic timestamps. Readings never decrease.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// `Instant`-backed clock. Readings are relative to construction.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    ns: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub const fn new(start_ns: u64) -> Self {
        Self {
            ns: AtomicU64::new(start_ns),
        }
    }

    pub fn advance(&self, delta_ns: u64) {
        self.ns.fetch_add(delta_ns, Ordering::Relaxed);
    }

    /// Sets the reading. Ignored if it would move the clock backwards.
    pub fn set(&self, ns: u64) {
        self.ns.fetch_max(ns, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::Relaxed)
    }
}

/// Nanoseconds from `earlier` to `later`, zero if the clock was reset.
#[must_use]
pub const fn elapsed_ns(earlier: u64, later: u64) -> u64 {
    later.saturating_sub(earlier)
}
