//! Thread state.
//!
//! A [`Tsd`] is owned by one thread. The only parts other threads may touch
//! are the state byte and the two fast thresholds in [`TsdShared`]: a remote
//! global-slow change moves a nominal thread to `NominalRecompute` and zeroes
//! its thresholds, which sends the owner's next operation down the slow path
//! where it re-derives its state.
//!
//! Allocation and deallocation take the fast path only when the byte counter
//! stays below the fast threshold and the tcache can serve the request
//! without refilling or flushing.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::error::{RegisterError, TcacheError, TcachesError};
use crate::event::{Direction, Peak, RegisterOutcome, ThreadEvents, UserHook};
use crate::log::{LifecycleRecord, LogLevel};
use crate::malloc::arena::Arena;
use crate::malloc::cache_bin::CacheBinInfo;
use crate::malloc::tcache::{self, ThreadCache};
use crate::runtime::Runtime;
use crate::size_class::{self, TCACHE_MAXCLASS_LIMIT, TCACHE_NBINS_MAX};

/// Called by the peak event with `(thread_allocated, thread_deallocated)`.
pub type ActivityCallback = Box<dyn FnMut(u64, u64) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TsdState {
    /// Fast path allowed.
    Nominal = 0,
    /// Alive, but some local condition forbids the fast path.
    NominalSlow = 1,
    /// A remote change is pending; state must be recomputed.
    NominalRecompute = 2,
    /// Thread teardown.
    Purgatory = 3,
}

impl TsdState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Nominal,
            1 => Self::NominalSlow,
            2 => Self::NominalRecompute,
            _ => Self::Purgatory,
        }
    }

    #[must_use]
    pub const fn is_nominal(self) -> bool {
        !matches!(self, Self::Purgatory)
    }
}

/// Cross-thread visible part of a thread's state.
#[derive(Debug)]
pub struct TsdShared {
    state: AtomicU8,
    next_event_fast: [AtomicU64; 2],
}

impl TsdShared {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(TsdState::Nominal as u8),
            next_event_fast: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> TsdState {
        TsdState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TsdState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn exchange_state(&self, state: TsdState) -> TsdState {
        TsdState::from_u8(self.state.swap(state as u8, Ordering::Acquire))
    }

    #[inline]
    #[must_use]
    pub fn fast_threshold(&self, direction: Direction) -> u64 {
        self.next_event_fast[direction as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn set_fast_threshold(&self, direction: Direction, value: u64) {
        self.next_event_fast[direction as usize].store(value, Ordering::Relaxed);
    }

    pub(crate) fn zero_fast_thresholds(&self) {
        for fast in &self.next_event_fast {
            fast.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for TsdShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of one direction's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext {
    pub current_bytes: u64,
    pub last_event: u64,
    pub next_event: u64,
    pub next_event_fast: u64,
}

pub struct Tsd {
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) shared: Arc<TsdShared>,
    pub(crate) events: ThreadEvents,
    pub(crate) reentrancy: u32,
    pub(crate) tcache_enabled: bool,
    pub(crate) tcache: Option<ThreadCache>,
    pub(crate) tcache_nbins: usize,
    pub(crate) arena: Arc<dyn Arena>,
    pub(crate) peak: Peak,
    pub(crate) stats_interval_last_event: u64,
    activity_callback: Option<ActivityCallback>,
}

impl Tsd {
    /// Set up a thread against `runtime`: pick its arena, build its tcache
    /// if enabled and arm its events.
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let arena = runtime.choose_arena();
        let shared = Arc::new(TsdShared::new());
        runtime.register_nominal(&shared);
        let mut tsd = Self {
            tcache_enabled: runtime.options().tcache,
            tcache_nbins: runtime.default_nbins(),
            runtime,
            shared,
            events: ThreadEvents::default(),
            reentrancy: 0,
            tcache: None,
            arena,
            peak: Peak::default(),
            stats_interval_last_event: 0,
            activity_callback: None,
        };
        if tsd.tcache_enabled {
            let info = *tsd.runtime.bin_info();
            tsd.tcache_data_init(&info);
        }
        tsd.slow_update();
        tsd.te_init();
        let arena_ind = tsd.arena.ind();
        let tcache_id = tsd.tcache.as_ref().map(ThreadCache::id);
        tsd.runtime.lifecycle().push_with(LogLevel::Debug, || {
            let record = LifecycleRecord::new(LogLevel::Debug, "thread_init", "init", "ok")
                .with_details(format!("arena={arena_ind}"));
            match tcache_id {
                Some(id) => record.with_tcache(id),
                None => record,
            }
        });
        tsd
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    #[must_use]
    pub fn shared(&self) -> &Arc<TsdShared> {
        &self.shared
    }

    #[must_use]
    pub fn state(&self) -> TsdState {
        self.shared.state()
    }

    #[must_use]
    pub fn arena(&self) -> &Arc<dyn Arena> {
        &self.arena
    }

    #[must_use]
    pub fn tcache(&self) -> Option<&ThreadCache> {
        self.tcache.as_ref()
    }

    #[must_use]
    pub fn events(&self) -> &ThreadEvents {
        &self.events
    }

    #[must_use]
    pub fn reentrancy_level(&self) -> u32 {
        self.reentrancy
    }

    #[must_use]
    pub fn thread_allocated(&self) -> u64 {
        self.events.state(Direction::Alloc).current
    }

    #[must_use]
    pub fn thread_deallocated(&self) -> u64 {
        self.events.state(Direction::Dalloc).current
    }

    #[must_use]
    pub fn event_context(&self, direction: Direction) -> EventContext {
        let state = self.events.state(direction);
        EventContext {
            current_bytes: state.current,
            last_event: state.last,
            next_event: state.next,
            next_event_fast: self.shared.fast_threshold(direction),
        }
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    fn slow_reasons(&self) -> bool {
        !self.tcache_enabled
            || self.tcache.is_none()
            || self.reentrancy > 0
            || self.runtime.global_slow() > 0
    }

    /// Re-derive `Nominal` versus `NominalSlow`, absorbing any pending remote
    /// recompute request.
    pub(crate) fn slow_update(&mut self) {
        if self.shared.state() == TsdState::Purgatory {
            return;
        }
        loop {
            let computed = if self.slow_reasons() {
                TsdState::NominalSlow
            } else {
                TsdState::Nominal
            };
            if self.shared.exchange_state(computed) != TsdState::NominalRecompute {
                break;
            }
        }
        self.recompute_fast_threshold();
    }

    #[inline]
    fn absorb_recompute(&mut self) {
        if self.shared.state() == TsdState::NominalRecompute {
            self.slow_update();
        }
    }

    /// Enter a region where handlers and allocator-internal work run; the
    /// thread bypasses its tcache and postpones events until the matching
    /// [`post_reentrancy`](Self::post_reentrancy).
    pub fn pre_reentrancy(&mut self) {
        self.reentrancy += 1;
        if self.reentrancy == 1 {
            self.slow_update();
        }
    }

    pub fn post_reentrancy(&mut self) {
        debug_assert!(self.reentrancy > 0);
        self.reentrancy = self.reentrancy.saturating_sub(1);
        if self.reentrancy == 0 {
            self.slow_update();
        }
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate `size` bytes. `None` for sizes above the largest class or
    /// when the arena is exhausted.
    #[inline]
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        let binind = size_class::size2index(size)?;
        let usize = size_class::index2size(binind) as u64;
        let after = self.thread_allocated().wrapping_add(usize);
        if after < self.shared.fast_threshold(Direction::Alloc) {
            if let Some(ptr) = self.tcache.as_mut().and_then(|tc| tc.alloc_easy(binind)) {
                self.events.advance(Direction::Alloc, usize);
                return Some(ptr);
            }
        }
        self.alloc_slow(binind, usize)
    }

    fn alloc_slow(&mut self, binind: usize, usize: u64) -> Option<usize> {
        self.absorb_recompute();
        let ptr = match self.usable_tcache() {
            Some(tc) => tc.alloc(binind),
            None => arena_alloc_one(self.arena.as_ref(), binind),
        }?;
        self.after_op(Direction::Alloc, usize);
        Some(ptr)
    }

    /// Free `ptr`, allocated with `size` bytes.
    #[inline]
    pub fn dealloc(&mut self, ptr: usize, size: usize) {
        let Some(binind) = size_class::size2index(size) else {
            self.invalid_free(ptr, size);
            return;
        };
        let usize = size_class::index2size(binind) as u64;
        let after = self.thread_deallocated().wrapping_add(usize);
        if after < self.shared.fast_threshold(Direction::Dalloc)
            && self
                .tcache
                .as_mut()
                .is_some_and(|tc| tc.dalloc_easy(binind, ptr))
        {
            self.events.advance(Direction::Dalloc, usize);
            return;
        }
        self.dealloc_slow(binind, ptr, usize);
    }

    fn dealloc_slow(&mut self, binind: usize, ptr: usize, usize: u64) {
        self.absorb_recompute();
        match self.usable_tcache() {
            Some(tc) => tc.dalloc(binind, ptr),
            None => self.arena.free_batch(binind, &[ptr]),
        }
        self.after_op(Direction::Dalloc, usize);
    }

    /// Allocate through explicit tcache `handle`.
    pub fn alloc_explicit(&mut self, handle: u32, size: usize) -> Result<Option<usize>, TcachesError> {
        let Some(binind) = size_class::size2index(size) else {
            return Ok(None);
        };
        let cache = self.runtime.tcaches_get(handle)?;
        let ptr = cache.lock().alloc(binind);
        if ptr.is_some() {
            self.absorb_recompute();
            self.after_op(Direction::Alloc, size_class::index2size(binind) as u64);
        }
        Ok(ptr)
    }

    /// Free through explicit tcache `handle`.
    pub fn dealloc_explicit(&mut self, handle: u32, ptr: usize, size: usize) -> Result<(), TcachesError> {
        let Some(binind) = size_class::size2index(size) else {
            self.invalid_free(ptr, size);
            return Ok(());
        };
        let cache = self.runtime.tcaches_get(handle)?;
        cache.lock().dalloc(binind, ptr);
        self.absorb_recompute();
        self.after_op(Direction::Dalloc, size_class::index2size(binind) as u64);
        Ok(())
    }

    /// No class holds `size`, so `ptr` cannot have come from [`Tsd::alloc`].
    #[cold]
    fn invalid_free(&self, ptr: usize, size: usize) {
        self.arena.invalid_free(ptr);
        self.runtime.lifecycle().push_with(LogLevel::Warn, || {
            LifecycleRecord::new(LogLevel::Warn, "tsd_dealloc", "invalid_free", "rejected")
                .with_details(format!("ptr={ptr:#x};size={size}"))
        });
    }

    fn usable_tcache(&mut self) -> Option<&mut ThreadCache> {
        if !self.tcache_enabled || self.reentrancy > 0 {
            return None;
        }
        self.tcache.as_mut()
    }

    fn after_op(&mut self, direction: Direction, usize: u64) {
        if self.events.advance(direction, usize) {
            self.event_trigger(direction);
        }
    }

    // -----------------------------------------------------------------------
    // Tcache control
    // -----------------------------------------------------------------------

    fn tcache_data_init(&mut self, info: &[CacheBinInfo; TCACHE_NBINS_MAX]) {
        match self
            .runtime
            .new_tcache(info, self.tcache_nbins, self.arena.clone())
        {
            Ok(tc) => self.tcache = Some(tc),
            Err(err) => {
                self.tcache = None;
                self.runtime.lifecycle().push(
                    LifecycleRecord::new(LogLevel::Warn, "tcache_create", "create", "failed")
                        .with_details(err.to_string()),
                );
            }
        }
    }

    fn tcache_reinit(&mut self, info: &[CacheBinInfo; TCACHE_NBINS_MAX], reason: &'static str) {
        let old_id = self.tcache.take().map(|tc| tc.id());
        self.tcache_data_init(info);
        let new_id = self.tcache.as_ref().map(ThreadCache::id);
        let nbins = self.tcache_nbins;
        self.runtime.lifecycle().push_with(LogLevel::Debug, || {
            LifecycleRecord::new(LogLevel::Debug, "tcache_reinit", reason, "ok")
                .with_count(nbins)
                .with_details(format!("old={old_id:?};new={new_id:?}"))
        });
        self.slow_update();
    }

    #[must_use]
    pub fn tcache_enabled(&self) -> bool {
        self.tcache_enabled
    }

    pub fn set_tcache_enabled(&mut self, enabled: bool) {
        if enabled && !self.tcache_enabled {
            let info = *self.runtime.bin_info();
            self.tcache_data_init(&info);
        } else if !enabled && self.tcache_enabled {
            self.tcache = None;
        }
        self.tcache_enabled = enabled;
        self.slow_update();
    }

    /// Change the largest size this thread caches. The tcache is rebuilt on
    /// the same arena, keeping per-bin capacities.
    pub fn set_tcache_max(&mut self, tcache_max: usize) {
        let tcache_max = size_class::s2u(tcache_max.min(TCACHE_MAXCLASS_LIMIT)).unwrap_or(TCACHE_MAXCLASS_LIMIT);
        let backup = self.tcache.as_ref().map(ThreadCache::bin_settings);
        self.tcache_nbins = size_class::nbins_for_max(tcache_max);
        if let Some(info) = backup {
            self.tcache_reinit(&info, "tcache_max");
        }
    }

    #[must_use]
    pub fn tcache_nbins(&self) -> usize {
        self.tcache_nbins
    }

    /// Capacity of the bin serving `size`; 0 without a tcache or for a
    /// disabled bin.
    pub fn ncached_max_read(&self, size: usize) -> Result<u16, TcacheError> {
        if size > TCACHE_MAXCLASS_LIMIT {
            return Err(TcacheError::SizeTooLarge(size));
        }
        let Some(tc) = self.tcache.as_ref().filter(|_| self.tcache_enabled) else {
            return Ok(0);
        };
        let binind = size_class::size2index(size).ok_or(TcacheError::SizeTooLarge(size))?;
        Ok(tc.ncached_max(binind))
    }

    /// Apply a `start-end:count|...` settings string to this thread's bins
    /// and rebuild the tcache.
    pub fn ncached_max_write(&mut self, settings: &str) -> Result<(), TcacheError> {
        let Some(tc) = self.tcache.as_ref().filter(|_| self.tcache_enabled) else {
            return Err(TcacheError::Unavailable);
        };
        let mut info = tc.bin_settings();
        let parsed = hotbin_membrane::config::parse_bin_settings(settings)?;
        tcache::apply_bin_settings(&mut info, &parsed);
        self.tcache_reinit(&info, "ncached_max");
        Ok(())
    }

    /// Return every cached object to the arena.
    pub fn flush(&mut self) {
        if let Some(tc) = self.tcache.as_mut() {
            tc.flush_all();
            tc.stats_merge();
        }
    }

    // -----------------------------------------------------------------------
    // Peak and hooks
    // -----------------------------------------------------------------------

    /// Update the peak from the current counters and return it.
    pub(crate) fn peak_update(&mut self) -> u64 {
        let (allocated, deallocated) = (self.thread_allocated(), self.thread_deallocated());
        self.peak.update(allocated, deallocated);
        self.peak.max()
    }

    pub fn peak_read(&mut self) -> u64 {
        self.peak_update()
    }

    pub fn peak_reset(&mut self) {
        let (allocated, deallocated) = (self.thread_allocated(), self.thread_deallocated());
        self.peak.set_zero(allocated, deallocated);
    }

    pub fn set_activity_callback(&mut self, callback: Option<ActivityCallback>) {
        self.activity_callback = callback;
    }

    pub(crate) fn run_activity_callback(&mut self) {
        let (allocated, deallocated) = (self.thread_allocated(), self.thread_deallocated());
        if let Some(callback) = self.activity_callback.as_mut() {
            callback(allocated, deallocated);
        }
    }

    /// Register a user hook. On a fresh install the calling thread schedules
    /// it immediately; other threads pick it up on their next event pass.
    pub fn register_user_event(&mut self, hook: UserHook) -> Result<RegisterOutcome, RegisterError> {
        let result = self.runtime.user_hooks().register(hook);
        if let Ok(RegisterOutcome::Installed(slot)) = result {
            self.te_user_installed(slot, hook.interval, hook.alloc_only);
        }
        let level = if result.is_ok() { LogLevel::Info } else { LogLevel::Warn };
        self.runtime.lifecycle().push_with(level, || {
            let (outcome, details) = match result {
                Ok(RegisterOutcome::Installed(slot)) => ("installed", format!("slot={slot}")),
                Ok(RegisterOutcome::AlreadyRegistered) => ("already_registered", String::new()),
                Err(err) => ("rejected", err.to_string()),
            };
            LifecycleRecord::new(level, "hook_register", "register", outcome).with_details(format!(
                "{details};interval={};alloc_only={}",
                hook.interval, hook.alloc_only
            ))
        });
        result
    }
}

fn arena_alloc_one(arena: &dyn Arena, binind: usize) -> Option<usize> {
    let mut out = [0usize; 1];
    (arena.alloc_range(binind, &mut out, 1) == 1).then_some(out[0])
}

impl Drop for Tsd {
    fn drop(&mut self) {
        self.runtime.unregister_nominal(&self.shared);
        self.shared.set_state(TsdState::Purgatory);
        self.shared.zero_fast_thresholds();
        let tcache_id = self.tcache.take().map(|tc| tc.id());
        let (allocated, deallocated) = (self.thread_allocated(), self.thread_deallocated());
        self.runtime.lifecycle().push_with(LogLevel::Debug, || {
            let record = LifecycleRecord::new(LogLevel::Debug, "thread_cleanup", "cleanup", "ok")
                .with_details(format!("allocated={allocated};deallocated={deallocated}"));
            match tcache_id {
                Some(id) => record.with_tcache(id),
                None => record,
            }
        });
    }
}

impl std::fmt::Debug for Tsd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tsd")
            .field("state", &self.state())
            .field("allocated", &self.thread_allocated())
            .field("deallocated", &self.thread_deallocated())
            .field("reentrancy", &self.reentrancy)
            .field("tcache", &self.tcache)
            .finish_non_exhaustive()
    }
}

thread_local! {
    static THREAD_TSD: RefCell<Option<Tsd>> = const { RefCell::new(None) };
}

/// Run `f` on this thread's state, creating it against
/// [`Runtime::global`] on first use. `None` during thread teardown or when
/// called re-entrantly from inside `f`.
pub fn with_thread_tsd<R>(f: impl FnOnce(&mut Tsd) -> R) -> Option<R> {
    THREAD_TSD
        .try_with(|cell| {
            let mut slot = cell.try_borrow_mut().ok()?;
            let tsd = slot.get_or_insert_with(|| Tsd::new(Runtime::global().clone()));
            Some(f(tsd))
        })
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeBuilder;
    use hotbin_membrane::config::TcacheOptions;

    fn runtime(conf: &str) -> Arc<Runtime> {
        RuntimeBuilder::new(TcacheOptions::from_conf_str(conf).unwrap()).build()
    }

    #[test]
    fn fresh_thread_is_nominal_with_fast_thresholds() {
        let tsd = Tsd::new(runtime(""));
        assert_eq!(tsd.state(), TsdState::Nominal);
        let ctx = tsd.event_context(Direction::Alloc);
        assert_eq!(ctx.last_event, 0);
        assert_eq!(ctx.next_event, 65536, "tcache GC and peak both wait 64 KiB");
        assert_eq!(ctx.next_event_fast, ctx.next_event);
        assert_eq!(tsd.assert_invariants(), Ok(()));
    }

    #[test]
    fn disabled_tcache_forces_slow_path() {
        let mut tsd = Tsd::new(runtime("tcache:false"));
        assert_eq!(tsd.state(), TsdState::NominalSlow);
        assert_eq!(tsd.shared().fast_threshold(Direction::Alloc), 0);
        let p = tsd.alloc(64).unwrap();
        tsd.dealloc(p, 64);
        assert_eq!(tsd.thread_allocated(), 64);
        assert_eq!(tsd.thread_deallocated(), 64);
        tsd.set_tcache_enabled(true);
        assert_eq!(tsd.state(), TsdState::Nominal);
        assert!(tsd.tcache().is_some());
    }

    #[test]
    fn reentrancy_bypasses_tcache() {
        let mut tsd = Tsd::new(runtime(""));
        tsd.pre_reentrancy();
        assert_eq!(tsd.state(), TsdState::NominalSlow);
        let p = tsd.alloc(32).unwrap();
        assert_eq!(tsd.tcache().unwrap().total_cached(), 0);
        tsd.dealloc(p, 32);
        tsd.post_reentrancy();
        assert_eq!(tsd.state(), TsdState::Nominal);
        assert_eq!(tsd.arena().stats().live_objects(), 0);
    }

    #[test]
    fn oversized_requests_fail() {
        let mut tsd = Tsd::new(runtime(""));
        assert_eq!(tsd.alloc(TCACHE_MAXCLASS_LIMIT + 1), None);
        assert_eq!(tsd.thread_allocated(), 0);
        assert_eq!(
            tsd.ncached_max_read(TCACHE_MAXCLASS_LIMIT + 1),
            Err(TcacheError::SizeTooLarge(TCACHE_MAXCLASS_LIMIT + 1))
        );
    }

    #[test]
    fn oversized_frees_are_counted_not_dropped() {
        let rt = runtime("");
        let mut tsd = Tsd::new(rt.clone());
        rt.drain_lifecycle_logs();
        tsd.dealloc(0xdead_0000, TCACHE_MAXCLASS_LIMIT + 1);
        let handle = rt.tcaches_create().unwrap();
        tsd.dealloc_explicit(handle, 0xbeef_0000, TCACHE_MAXCLASS_LIMIT + 8).unwrap();
        assert_eq!(tsd.thread_deallocated(), 0);
        assert_eq!(tsd.arena().stats().invalid_frees, 2);
        let rejected: Vec<_> = rt
            .drain_lifecycle_logs()
            .into_iter()
            .filter(|r| r.event == "invalid_free")
            .map(|r| (r.level, r.details))
            .collect();
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].0, LogLevel::Warn);
        assert!(rejected[0].1.starts_with("ptr=0xdead0000;"), "{}", rejected[0].1);
    }

    #[test]
    fn tcache_max_rebuild_keeps_overrides_and_arena() {
        let mut tsd = Tsd::new(runtime(""));
        let arena = tsd.arena().ind();
        tsd.ncached_max_write("64-64:7").unwrap();
        assert_eq!(tsd.ncached_max_read(64), Ok(7));
        tsd.set_tcache_max(1024);
        assert_eq!(tsd.tcache_nbins(), size_class::size2index(1024).unwrap() + 1);
        assert_eq!(tsd.ncached_max_read(64), Ok(7));
        assert_eq!(tsd.ncached_max_read(16384), Ok(0), "bin above tcache_max is disabled");
        assert_eq!(tsd.tcache().unwrap().arena().ind(), arena);
        tsd.set_tcache_max(32 << 10);
        assert_eq!(tsd.ncached_max_read(16384), Ok(20));
    }

    #[test]
    fn ncached_max_write_rejects_bad_settings() {
        let mut tsd = Tsd::new(runtime(""));
        assert!(matches!(tsd.ncached_max_write("1-x:3"), Err(TcacheError::Settings(_))));
        tsd.set_tcache_enabled(false);
        assert_eq!(tsd.ncached_max_write("1-8:3"), Err(TcacheError::Unavailable));
        assert_eq!(tsd.ncached_max_read(8), Ok(0));
    }

    #[test]
    fn peak_tracks_net_usage() {
        let mut tsd = Tsd::new(runtime(""));
        let a = tsd.alloc(4096).unwrap();
        let b = tsd.alloc(4096).unwrap();
        tsd.dealloc(a, 4096);
        assert_eq!(tsd.peak_read(), 4096, "peak is sampled at read time");
        tsd.dealloc(b, 4096);
        tsd.peak_reset();
        assert_eq!(tsd.peak_read(), 0);
    }

    #[test]
    fn drop_moves_to_purgatory_and_unregisters() {
        let rt = runtime("");
        let tsd = Tsd::new(rt.clone());
        let shared = tsd.shared().clone();
        assert_eq!(rt.nominal_threads(), 1);
        drop(tsd);
        assert_eq!(shared.state(), TsdState::Purgatory);
        assert_eq!(rt.nominal_threads(), 0);
        let logs = rt.drain_lifecycle_logs();
        assert!(logs.iter().any(|r| r.symbol == "thread_cleanup"));
        assert!(logs.iter().any(|r| r.symbol == "tcache_destroy"));
    }

    #[test]
    fn thread_local_state_is_reentrancy_safe() {
        let first = with_thread_tsd(|tsd| tsd.alloc(16));
        assert!(matches!(first, Some(Some(_))));
        let nested = with_thread_tsd(|_| with_thread_tsd(|_| ()));
        assert_eq!(nested, Some(None));
    }
}
