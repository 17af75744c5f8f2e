//! Process-wide state shared by every thread state.
//!
//! A [`Runtime`] owns the tunables, the boot-time bin capacities, the arenas,
//! the user hook table, the explicit tcache registry and the list of nominal
//! threads that global slow-path changes must reach. Tests and the harness
//! build their own through [`RuntimeBuilder`]; [`Runtime::global`] is the
//! default one backing [`with_thread_tsd`](crate::tsd::with_thread_tsd).

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering, fence};
use std::sync::{Arc, OnceLock, Weak};

use hotbin_membrane::config::{self, ConfigError, TcacheOptions};
use hotbin_membrane::nstime::{Clock, MonotonicClock};
use parking_lot::Mutex;

use crate::error::{TcacheError, TcachesError};
use crate::event::{CounterAccum, ProfilingHooks, UserHookTable};
use crate::log::{LifecycleLog, LifecycleRecord, LogLevel};
use crate::malloc::arena::{Arena, SimArena};
use crate::malloc::cache_bin::CacheBinInfo;
use crate::malloc::tcache::{self, TcacheContext, TcacheTunables, ThreadCache};
use crate::malloc::tcaches::ExplicitTcaches;
use crate::size_class::{self, TCACHE_NBINS_MAX};
use crate::tsd::{TsdShared, TsdState};

pub struct RuntimeBuilder {
    options: TcacheOptions,
    arenas: Vec<Arc<dyn Arena>>,
    prof: Option<Arc<dyn ProfilingHooks>>,
    clock: Option<Arc<dyn Clock>>,
    conf_error: Option<ConfigError>,
}

impl RuntimeBuilder {
    #[must_use]
    pub fn new(options: TcacheOptions) -> Self {
        Self {
            options,
            arenas: Vec::new(),
            prof: None,
            clock: None,
            conf_error: None,
        }
    }

    /// Use `arenas` instead of `narenas` simulated ones.
    #[must_use]
    pub fn arenas(mut self, arenas: Vec<Arc<dyn Arena>>) -> Self {
        self.arenas = arenas;
        self
    }

    #[must_use]
    pub fn arena(mut self, arena: Arc<dyn Arena>) -> Self {
        self.arenas.push(arena);
        self
    }

    #[must_use]
    pub fn prof(mut self, hooks: Arc<dyn ProfilingHooks>) -> Self {
        self.prof = Some(hooks);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Record that the options were only partly applied.
    #[must_use]
    pub fn conf_error(mut self, err: Option<ConfigError>) -> Self {
        self.conf_error = err;
        self
    }

    pub fn build(self) -> Arc<Runtime> {
        let options = self.options;
        let arenas = if self.arenas.is_empty() {
            (0..options.narenas.max(1))
                .map(|ind| Arc::new(SimArena::new(ind)) as Arc<dyn Arena>)
                .collect()
        } else {
            self.arenas
        };
        let tcache_max = options.tcache_max.min(size_class::TCACHE_MAXCLASS_LIMIT);
        // An interval of 0 snapshots on every batch; negative disables.
        let stats_interval = u64::try_from(options.stats_interval).map_or(0, |v| v.max(1));
        let log = Arc::new(LifecycleLog::new(options.log_level, options.log_capacity));
        let runtime = Runtime {
            bin_info: tcache::default_bin_info(&options),
            default_nbins: size_class::nbins_for_max(tcache_max),
            tunables: TcacheTunables::from_options(&options),
            arenas,
            next_arena: AtomicUsize::new(0),
            user_hooks: UserHookTable::new(),
            tcaches: ExplicitTcaches::new(options.max_explicit_tcaches),
            next_tcache_id: AtomicU64::new(1),
            global_slow: AtomicU32::new(0),
            nominal_tsds: Mutex::new(Vec::new()),
            stats_accum: CounterAccum::new(stats_interval),
            stats_snapshots: AtomicU64::new(0),
            prof: self.prof,
            clock: self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::new())),
            log,
            options,
        };
        runtime.log.push_with(LogLevel::Info, || {
            LifecycleRecord::new(LogLevel::Info, "runtime_boot", "boot", "ok")
                .with_count(runtime.default_nbins)
                .with_details(format!(
                    "narenas={};tcache={};tcache_max={tcache_max};experimental_gc={}",
                    runtime.arenas.len(),
                    runtime.options.tcache,
                    runtime.options.experimental_tcache_gc
                ))
        });
        if let Some(err) = &self.conf_error {
            runtime.log.push_with(LogLevel::Warn, || {
                LifecycleRecord::new(LogLevel::Warn, "runtime_boot", "conf", "invalid")
                    .with_details(format!("error={err}"))
            });
        }
        Arc::new(runtime)
    }
}

pub struct Runtime {
    options: TcacheOptions,
    bin_info: [CacheBinInfo; TCACHE_NBINS_MAX],
    default_nbins: usize,
    tunables: TcacheTunables,
    arenas: Vec<Arc<dyn Arena>>,
    next_arena: AtomicUsize,
    user_hooks: UserHookTable,
    tcaches: ExplicitTcaches,
    next_tcache_id: AtomicU64,
    global_slow: AtomicU32,
    nominal_tsds: Mutex<Vec<Weak<TsdShared>>>,
    stats_accum: CounterAccum,
    stats_snapshots: AtomicU64,
    prof: Option<Arc<dyn ProfilingHooks>>,
    clock: Arc<dyn Clock>,
    log: Arc<LifecycleLog>,
}

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

impl Runtime {
    /// Runtime configured from `HOTBIN_CONF`, over simulated arenas.
    pub fn global() -> &'static Arc<Runtime> {
        GLOBAL.get_or_init(|| {
            RuntimeBuilder::new(config::options().clone())
                .conf_error(config::options_error().cloned())
                .build()
        })
    }

    #[must_use]
    pub fn options(&self) -> &TcacheOptions {
        &self.options
    }

    /// Boot-time capacity of every bin.
    #[must_use]
    pub fn bin_info(&self) -> &[CacheBinInfo; TCACHE_NBINS_MAX] {
        &self.bin_info
    }

    /// Bins enabled by the configured `tcache_max`.
    #[must_use]
    pub fn default_nbins(&self) -> usize {
        self.default_nbins
    }

    #[must_use]
    pub fn arenas(&self) -> &[Arc<dyn Arena>] {
        &self.arenas
    }

    /// Next arena in round-robin order.
    pub fn choose_arena(&self) -> Arc<dyn Arena> {
        let ind = self.next_arena.fetch_add(1, Ordering::Relaxed) % self.arenas.len();
        self.arenas[ind].clone()
    }

    #[must_use]
    pub fn user_hooks(&self) -> &UserHookTable {
        &self.user_hooks
    }

    #[must_use]
    pub fn tcaches(&self) -> &ExplicitTcaches {
        &self.tcaches
    }

    #[must_use]
    pub fn prof(&self) -> Option<&Arc<dyn ProfilingHooks>> {
        self.prof.as_ref()
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleLog> {
        &self.log
    }

    pub fn drain_lifecycle_logs(&self) -> Vec<LifecycleRecord> {
        self.log.drain()
    }

    #[must_use]
    pub fn stats_accum(&self) -> &CounterAccum {
        &self.stats_accum
    }

    /// Stats-interval snapshots taken so far.
    #[must_use]
    pub fn stats_snapshots(&self) -> u64 {
        self.stats_snapshots.load(Ordering::Relaxed)
    }

    pub(crate) fn record_stats_snapshot(&self, thread_allocated: u64) {
        let seq = self.stats_snapshots.fetch_add(1, Ordering::Relaxed) + 1;
        self.log.push_with(LogLevel::Info, || {
            let (nmalloc, ndalloc, nrequests) = self.arenas.iter().map(|a| a.stats()).fold(
                (0, 0, 0),
                |(m, d, r), s| (m + s.nmalloc, d + s.ndalloc, r + s.total_requests()),
            );
            LifecycleRecord::new(LogLevel::Info, "stats_interval", "snapshot", "recorded")
                .with_details(format!(
                    "seq={seq};thread_allocated={thread_allocated};nmalloc={nmalloc};ndalloc={ndalloc};nrequests={nrequests}"
                ))
        });
    }

    #[must_use]
    pub fn tcache_context(&self) -> TcacheContext {
        TcacheContext {
            tunables: self.tunables,
            clock: self.clock.clone(),
            log: self.log.clone(),
        }
    }

    /// Build a tcache with a fresh id.
    pub fn new_tcache(
        &self,
        info: &[CacheBinInfo; TCACHE_NBINS_MAX],
        nbins: usize,
        arena: Arc<dyn Arena>,
    ) -> Result<ThreadCache, TcacheError> {
        let id = self.next_tcache_id.fetch_add(1, Ordering::Relaxed);
        ThreadCache::new(id, info, nbins, arena, self.tcache_context())
    }

    fn new_explicit_tcache(&self) -> Result<ThreadCache, TcacheError> {
        self.new_tcache(&self.bin_info, self.default_nbins, self.choose_arena())
    }

    pub fn tcaches_create(&self) -> Result<u32, TcachesError> {
        let result = self.tcaches.create(|| self.new_explicit_tcache());
        self.log_tcaches("create", result.as_ref().ok().copied(), result.as_ref().err());
        result
    }

    pub fn tcaches_flush(&self, handle: u32) -> Result<(), TcachesError> {
        let result = self.tcaches.flush(handle);
        self.log_tcaches("flush", Some(handle), result.as_ref().err());
        result
    }

    pub fn tcaches_destroy(&self, handle: u32) -> Result<(), TcachesError> {
        let result = self.tcaches.destroy(handle);
        self.log_tcaches("destroy", Some(handle), result.as_ref().err());
        result
    }

    pub(crate) fn tcaches_get(&self, handle: u32) -> Result<crate::malloc::tcaches::SharedTcache, TcachesError> {
        self.tcaches.get(handle, || self.new_explicit_tcache())
    }

    fn log_tcaches(&self, event: &'static str, handle: Option<u32>, err: Option<&TcachesError>) {
        let level = if err.is_some() { LogLevel::Warn } else { LogLevel::Debug };
        self.log.push_with(level, || {
            let outcome = if err.is_some() { "error" } else { "ok" };
            let details = match (handle, err) {
                (Some(h), Some(e)) => format!("handle={h};error={e}"),
                (Some(h), None) => format!("handle={h}"),
                (None, Some(e)) => format!("error={e}"),
                (None, None) => String::new(),
            };
            LifecycleRecord::new(level, "tcaches", event, outcome).with_details(details)
        });
    }

    #[must_use]
    pub fn global_slow(&self) -> u32 {
        self.global_slow.load(Ordering::Acquire)
    }

    /// Force every thread onto the slow path until the matching
    /// [`global_slow_dec`](Self::global_slow_dec).
    pub fn global_slow_inc(&self) {
        self.global_slow.fetch_add(1, Ordering::AcqRel);
        self.force_recompute();
    }

    pub fn global_slow_dec(&self) {
        let prev = self
            .global_slow
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        debug_assert!(prev.is_ok(), "unbalanced global_slow_dec");
        self.force_recompute();
    }

    /// Make every nominal thread re-derive its state on its next operation.
    pub fn force_recompute(&self) {
        let tsds = self.nominal_tsds.lock();
        for shared in tsds.iter().filter_map(Weak::upgrade) {
            shared.set_state(TsdState::NominalRecompute);
            fence(Ordering::SeqCst);
            shared.zero_fast_thresholds();
        }
    }

    pub(crate) fn register_nominal(&self, shared: &Arc<TsdShared>) {
        let mut tsds = self.nominal_tsds.lock();
        tsds.retain(|w| w.strong_count() > 0);
        tsds.push(Arc::downgrade(shared));
    }

    pub(crate) fn unregister_nominal(&self, shared: &Arc<TsdShared>) {
        let target = Arc::as_ptr(shared);
        self.nominal_tsds
            .lock()
            .retain(|w| w.strong_count() > 0 && w.as_ptr() != target);
    }

    /// Threads currently registered as nominal.
    #[must_use]
    pub fn nominal_threads(&self) -> usize {
        self.nominal_tsds
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("default_nbins", &self.default_nbins)
            .field("narenas", &self.arenas.len())
            .field("global_slow", &self.global_slow())
            .field("user_hooks", &self.user_hooks)
            .field("tcaches", &self.tcaches)
            .finish_non_exhaustive()
    }
}
