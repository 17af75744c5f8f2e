//! Byte-paced thread events.
//!
//! Every allocation and deallocation advances a per-thread byte counter.
//! Periodic work (tcache GC, stats flushing, peak tracking, profiling and
//! user hooks) is expressed as handlers that ask to run again after some
//! number of bytes; the scheduler keeps the nearest deadline in a single
//! threshold so the common path is one comparison.

pub mod peak;
pub mod prof;
pub mod registry;
pub mod scheduler;
pub mod stats_interval;
pub mod tcache_gc;

use std::fmt;

use crate::runtime::Runtime;
use crate::size_class::SC_LARGE_MAXCLASS;
use crate::tsd::Tsd;

pub use peak::{PEAK_EVENT_WAIT, Peak};
pub use prof::ProfilingHooks;
pub use registry::{MAX_USER_EVENTS, RegisterOutcome, UserEventCallback, UserHook, UserHookTable};
pub use scheduler::{DirectionState, ThreadEvents};
pub use stats_interval::CounterAccum;

/// Initial value of the running minimum over handler waits.
pub const TE_MAX_START_WAIT: u64 = u64::MAX;
/// Smallest wait a handler may ask for.
pub const TE_MIN_START_WAIT: u64 = 1;
/// Largest gap between two scheduler passes.
pub const TE_MAX_INTERVAL: u64 = 4 << 20;
/// Thresholds above this never take the fast path, so `current + usize`
/// cannot wrap in the fast comparison.
pub const TE_NEXT_EVENT_FAST_MAX: u64 = u64::MAX - SC_LARGE_MAXCLASS + 1;

/// Which byte counter an event is paced by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Alloc,
    Dalloc,
}

impl Direction {
    pub const ALL: [Self; 2] = [Self::Alloc, Self::Dalloc];

    #[must_use]
    pub const fn is_alloc(self) -> bool {
        matches!(self, Self::Alloc)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alloc => "alloc",
            Self::Dalloc => "dalloc",
        }
    }

    /// Wait-table index of user slot `slot`.
    #[must_use]
    pub const fn user_index(self, slot: usize) -> usize {
        match self {
            Self::Alloc => ALLOC_USER0 + slot,
            Self::Dalloc => DALLOC_USER0 + slot,
        }
    }

    #[must_use]
    pub const fn event_count(self) -> usize {
        match self {
            Self::Alloc => ALLOC_EVENT_COUNT,
            Self::Dalloc => DALLOC_EVENT_COUNT,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handler identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ProfSample,
    StatsInterval,
    ProfThreshold,
    TcacheGc,
    Peak,
    User(usize),
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProfSample => "prof_sample",
            Self::StatsInterval => "stats_interval",
            Self::ProfThreshold => "prof_threshold",
            Self::TcacheGc => "tcache_gc",
            Self::Peak => "peak",
            Self::User(_) => "user",
        }
    }
}

/// Whether a handler currently participates in scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enabled {
    /// Empty user slot. Slots fill in order, so later slots are empty too.
    NotInstalled,
    Yes,
    No,
}

/// A periodic per-thread event.
pub trait EventHandler: Sync {
    fn kind(&self) -> EventKind;

    fn enabled(&self, runtime: &Runtime, direction: Direction) -> Enabled;

    /// Bytes until the next run after a normal run.
    fn new_event_wait(&self, tsd: &Tsd) -> u64;

    /// Bytes until the next attempt when a due run had to be skipped.
    fn postponed_event_wait(&self, _tsd: &Tsd) -> u64 {
        TE_MIN_START_WAIT
    }

    /// Fixed reschedule interval taking precedence over `new_event_wait`;
    /// 0 when there is none.
    fn override_wait(&self, _runtime: &Runtime) -> u64 {
        0
    }

    fn handle(&self, tsd: &mut Tsd, direction: Direction);
}

pub const ALLOC_EVENT_COUNT: usize = 5 + MAX_USER_EVENTS;
pub const DALLOC_EVENT_COUNT: usize = 2 + MAX_USER_EVENTS;
const ALLOC_USER0: usize = 5;
const DALLOC_USER0: usize = 2;

/// Allocation-side handlers in table order.
pub static ALLOC_EVENTS: [&dyn EventHandler; ALLOC_EVENT_COUNT] = [
    &prof::ProfSampleEvent,
    &stats_interval::StatsIntervalEvent,
    &prof::ProfThresholdEvent,
    &tcache_gc::TcacheGcEvent,
    &peak::PeakEvent,
    &registry::UserEvent { slot: 0 },
    &registry::UserEvent { slot: 1 },
    &registry::UserEvent { slot: 2 },
    &registry::UserEvent { slot: 3 },
];

/// Deallocation-side handlers in table order.
pub static DALLOC_EVENTS: [&dyn EventHandler; DALLOC_EVENT_COUNT] = [
    &tcache_gc::TcacheGcEvent,
    &peak::PeakEvent,
    &registry::UserEvent { slot: 0 },
    &registry::UserEvent { slot: 1 },
    &registry::UserEvent { slot: 2 },
    &registry::UserEvent { slot: 3 },
];

#[must_use]
pub fn handlers(direction: Direction) -> &'static [&'static dyn EventHandler] {
    match direction {
        Direction::Alloc => &ALLOC_EVENTS,
        Direction::Dalloc => &DALLOC_EVENTS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_follow_kind_order() {
        let alloc: Vec<EventKind> = ALLOC_EVENTS.iter().map(|h| h.kind()).collect();
        assert_eq!(
            &alloc[..5],
            &[
                EventKind::ProfSample,
                EventKind::StatsInterval,
                EventKind::ProfThreshold,
                EventKind::TcacheGc,
                EventKind::Peak
            ]
        );
        for slot in 0..MAX_USER_EVENTS {
            assert_eq!(alloc[Direction::Alloc.user_index(slot)], EventKind::User(slot));
            assert_eq!(
                DALLOC_EVENTS[Direction::Dalloc.user_index(slot)].kind(),
                EventKind::User(slot)
            );
        }
        assert_eq!(DALLOC_EVENTS[0].kind(), EventKind::TcacheGc);
    }

    #[test]
    fn fast_cap_leaves_room_for_largest_request() {
        assert_eq!(TE_NEXT_EVENT_FAST_MAX.checked_add(SC_LARGE_MAXCLASS - 1), Some(u64::MAX));
        assert!(TE_MAX_INTERVAL <= TE_NEXT_EVENT_FAST_MAX);
    }
}
