//! Periodic statistics snapshots, paced by process-wide allocation volume.
//!
//! Each thread reports its allocation bytes in batches; the runtime-wide
//! [`CounterAccum`] fires once per `stats_interval` bytes in total.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::event::{Direction, Enabled, EventHandler, EventKind};
use crate::runtime::Runtime;
use crate::tsd::Tsd;

/// Lock-free byte accumulator that fires every `interval` bytes.
#[derive(Debug)]
pub struct CounterAccum {
    interval: u64,
    accumbytes: AtomicU64,
}

impl CounterAccum {
    #[must_use]
    pub const fn new(interval: u64) -> Self {
        Self {
            interval,
            accumbytes: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn interval(&self) -> u64 {
        self.interval
    }

    /// Add `bytes`. Returns whether the interval was crossed; the remainder
    /// carries over. An interval of 0 is the disabled accumulator.
    pub fn accum(&self, bytes: u64) -> bool {
        if self.interval == 0 {
            return false;
        }
        let mut a0 = self.accumbytes.load(Ordering::Relaxed);
        loop {
            let mut a1 = a0.saturating_add(bytes);
            let overflow = a1 >= self.interval;
            if overflow {
                a1 %= self.interval;
            }
            match self
                .accumbytes
                .compare_exchange_weak(a0, a1, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return overflow,
                Err(current) => a0 = current,
            }
        }
    }

    #[must_use]
    pub fn pending(&self) -> u64 {
        self.accumbytes.load(Ordering::Relaxed)
    }
}

pub(crate) struct StatsIntervalEvent;

impl EventHandler for StatsIntervalEvent {
    fn kind(&self) -> EventKind {
        EventKind::StatsInterval
    }

    fn enabled(&self, runtime: &Runtime, _direction: Direction) -> Enabled {
        if runtime.options().stats_interval_enabled() {
            Enabled::Yes
        } else {
            Enabled::No
        }
    }

    fn new_event_wait(&self, tsd: &Tsd) -> u64 {
        tsd.runtime().options().stats_interval_accum_batch()
    }

    fn override_wait(&self, runtime: &Runtime) -> u64 {
        runtime.options().stats_interval_accum_batch()
    }

    fn handle(&self, tsd: &mut Tsd, _direction: Direction) {
        let allocated = tsd.thread_allocated();
        let bytes = allocated.wrapping_sub(tsd.stats_interval_last_event);
        tsd.stats_interval_last_event = allocated;
        let runtime = tsd.runtime().clone();
        if runtime.stats_accum().accum(bytes) {
            runtime.record_stats_snapshot(allocated);
        }
    }
}
