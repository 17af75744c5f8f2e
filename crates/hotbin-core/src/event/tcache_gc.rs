//! Tcache GC event: runs the thread cache's incremental GC every
//! `tcache_gc_incr_bytes` in either direction.

use crate::event::{Direction, Enabled, EventHandler, EventKind};
use crate::runtime::Runtime;
use crate::tsd::Tsd;

pub(crate) struct TcacheGcEvent;

impl EventHandler for TcacheGcEvent {
    fn kind(&self) -> EventKind {
        EventKind::TcacheGc
    }

    fn enabled(&self, runtime: &Runtime, _direction: Direction) -> Enabled {
        if runtime.options().tcache_gc_enabled() {
            Enabled::Yes
        } else {
            Enabled::No
        }
    }

    fn new_event_wait(&self, tsd: &Tsd) -> u64 {
        tsd.runtime().options().tcache_gc_incr_bytes
    }

    fn override_wait(&self, runtime: &Runtime) -> u64 {
        runtime.options().tcache_gc_incr_bytes
    }

    fn handle(&self, tsd: &mut Tsd, _direction: Direction) {
        if let Some(tcache) = tsd.tcache.as_mut() {
            tcache.gc_event();
        }
    }
}
