//! Explicit tcaches: caches created and destroyed by handle rather than tied
//! to a thread.
//!
//! Handles are stable slot indices. Destroyed slots go onto an intrusive free
//! list and are reused before the table grows. Flushing a handle destroys its
//! cache but keeps the slot; the cache is rebuilt on next use.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{TcacheError, TcachesError};
use crate::malloc::tcache::ThreadCache;

pub type SharedTcache = Arc<Mutex<ThreadCache>>;

enum Slot {
    Live(SharedTcache),
    NeedsReinit,
    Free { next: Option<u32> },
}

/// Externally visible state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never handed out.
    Empty,
    Live,
    NeedsReinit,
    Free,
}

struct Inner {
    slots: Vec<Slot>,
    avail: Option<u32>,
}

pub struct ExplicitTcaches {
    inner: Mutex<Inner>,
    max: usize,
}

impl ExplicitTcaches {
    /// A registry handing out handles `0..=max`.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                avail: None,
            }),
            max,
        }
    }

    /// Create a cache with `make` and return its handle.
    pub fn create(
        &self,
        make: impl FnOnce() -> Result<ThreadCache, TcacheError>,
    ) -> Result<u32, TcachesError> {
        let mut inner = self.inner.lock();
        let reuse = inner.avail;
        if reuse.is_none() && inner.slots.len() > self.max {
            return Err(TcachesError::Full);
        }
        let cache = Arc::new(Mutex::new(make()?));
        match reuse {
            Some(handle) => {
                let idx = handle as usize;
                inner.avail = match inner.slots[idx] {
                    Slot::Free { next } => next,
                    _ => None,
                };
                inner.slots[idx] = Slot::Live(cache);
                Ok(handle)
            }
            None => {
                let handle = u32::try_from(inner.slots.len()).map_err(|_| TcachesError::Full)?;
                inner.slots.push(Slot::Live(cache));
                Ok(handle)
            }
        }
    }

    /// The cache behind `handle`, rebuilt with `make` if it was flushed.
    pub fn get(
        &self,
        handle: u32,
        make: impl FnOnce() -> Result<ThreadCache, TcacheError>,
    ) -> Result<SharedTcache, TcachesError> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(handle as usize)
            .ok_or(TcachesError::InvalidHandle(handle))?;
        match slot {
            Slot::Live(cache) => Ok(cache.clone()),
            Slot::NeedsReinit => {
                let cache = Arc::new(Mutex::new(make()?));
                *slot = Slot::Live(cache.clone());
                Ok(cache)
            }
            Slot::Free { .. } => Err(TcachesError::InvalidHandle(handle)),
        }
    }

    /// Destroy the cache behind `handle`, keeping the handle valid.
    pub fn flush(&self, handle: u32) -> Result<(), TcachesError> {
        let old = {
            let mut inner = self.inner.lock();
            let slot = inner
                .slots
                .get_mut(handle as usize)
                .ok_or(TcachesError::InvalidHandle(handle))?;
            if matches!(slot, Slot::Free { .. }) {
                return Err(TcachesError::InvalidHandle(handle));
            }
            std::mem::replace(slot, Slot::NeedsReinit)
        };
        // The cache flushes itself into its arena when the last user lets go.
        drop(old);
        Ok(())
    }

    /// Destroy the cache and release `handle` for reuse.
    pub fn destroy(&self, handle: u32) -> Result<(), TcachesError> {
        let old = {
            let mut inner = self.inner.lock();
            let next = inner.avail;
            let slot = inner
                .slots
                .get_mut(handle as usize)
                .ok_or(TcachesError::InvalidHandle(handle))?;
            if matches!(slot, Slot::Free { .. }) {
                return Err(TcachesError::InvalidHandle(handle));
            }
            let old = std::mem::replace(slot, Slot::Free { next });
            inner.avail = Some(handle);
            old
        };
        drop(old);
        Ok(())
    }

    #[must_use]
    pub fn slot_state(&self, handle: u32) -> SlotState {
        match self.inner.lock().slots.get(handle as usize) {
            None => SlotState::Empty,
            Some(Slot::Live(_)) => SlotState::Live,
            Some(Slot::NeedsReinit) => SlotState::NeedsReinit,
            Some(Slot::Free { .. }) => SlotState::Free,
        }
    }

    /// Handles that currently hold a cache.
    #[must_use]
    pub fn live(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|s| matches!(s, Slot::Live(_)))
            .count()
    }

    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }
}

impl std::fmt::Debug for ExplicitTcaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplicitTcaches")
            .field("max", &self.max)
            .field("live", &self.live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::arena::{Arena, SimArena};
    use crate::malloc::cache_bin::CacheBinInfo;
    use crate::malloc::tcache::{TcacheTunables, tests::ctx};
    use crate::size_class::TCACHE_NBINS_MAX;

    fn maker(arena: &Arc<SimArena>) -> impl Fn() -> Result<ThreadCache, TcacheError> + '_ {
        move || {
            let (ctx, _) = ctx(TcacheTunables::default());
            ThreadCache::new(0, &[CacheBinInfo::new(4); TCACHE_NBINS_MAX], 8, arena.clone(), ctx)
        }
    }

    #[test]
    fn destroyed_handles_are_reused_first() {
        let arena = Arc::new(SimArena::new(0));
        let reg = ExplicitTcaches::new(16);
        let a = reg.create(maker(&arena)).unwrap();
        let b = reg.create(maker(&arena)).unwrap();
        let c = reg.create(maker(&arena)).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        reg.destroy(b).unwrap();
        reg.destroy(a).unwrap();
        assert_eq!(reg.slot_state(a), SlotState::Free);
        assert_eq!(reg.create(maker(&arena)).unwrap(), a, "most recently freed first");
        assert_eq!(reg.create(maker(&arena)).unwrap(), b);
        assert_eq!(reg.create(maker(&arena)).unwrap(), 3);
    }

    #[test]
    fn table_is_bounded() {
        let arena = Arc::new(SimArena::new(0));
        let reg = ExplicitTcaches::new(1);
        reg.create(maker(&arena)).unwrap();
        reg.create(maker(&arena)).unwrap();
        assert_eq!(reg.create(maker(&arena)), Err(TcachesError::Full));
        reg.destroy(0).unwrap();
        assert_eq!(reg.create(maker(&arena)), Ok(0));
    }

    #[test]
    fn flush_returns_objects_and_rebuilds_lazily() {
        let arena = Arc::new(SimArena::new(0));
        let reg = ExplicitTcaches::new(4);
        let h = reg.create(maker(&arena)).unwrap();
        {
            let cache = reg.get(h, maker(&arena)).unwrap();
            let mut tc = cache.lock();
            let p = tc.alloc(2).unwrap();
            tc.dalloc(2, p);
        }
        assert_eq!(arena.stats().live_tcaches, 1);
        reg.flush(h).unwrap();
        assert_eq!(reg.slot_state(h), SlotState::NeedsReinit);
        assert_eq!(arena.stats().live_objects(), 0);
        assert_eq!(arena.stats().live_tcaches, 0);
        reg.get(h, maker(&arena)).unwrap();
        assert_eq!(reg.slot_state(h), SlotState::Live);
        assert_eq!(arena.stats().live_tcaches, 1);
    }

    #[test]
    fn unknown_and_freed_handles_are_rejected() {
        let arena = Arc::new(SimArena::new(0));
        let reg = ExplicitTcaches::new(4);
        assert_eq!(reg.flush(7), Err(TcachesError::InvalidHandle(7)));
        let h = reg.create(maker(&arena)).unwrap();
        reg.destroy(h).unwrap();
        assert_eq!(reg.destroy(h), Err(TcachesError::InvalidHandle(h)));
        assert!(matches!(reg.get(h, maker(&arena)), Err(TcachesError::InvalidHandle(_))));
        assert_eq!(reg.slot_state(9), SlotState::Empty);
    }
}
