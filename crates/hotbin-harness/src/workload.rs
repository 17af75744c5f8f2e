//! Seeded multi-thread workload.
//!
//! Each worker owns a thread state on a shared runtime and runs an LCG-driven
//! mix of allocations and frees, checking its event counters after every
//! operation. Optionally a user hook is installed before the workers start
//! and a toggler thread flips the global slow path underneath them. The run
//! ends by freeing everything and verifying that the arenas hold no objects.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use hotbin_core::{Arena, Direction, LifecycleRecord, RuntimeBuilder, Tsd, UserHook};
use hotbin_membrane::TcacheOptions;
use serde::Serialize;

use crate::error::HarnessError;

/// Request sizes, weighted toward small classes.
const SIZE_MIX: [usize; 12] = [8, 16, 24, 48, 64, 96, 128, 256, 512, 2048, 9000, 40 << 10];

static HOOK_CALLS: AtomicU64 = AtomicU64::new(0);

fn count_hook(_is_alloc: bool, _allocated: u64, _deallocated: u64) {
    HOOK_CALLS.fetch_add(1, Ordering::Relaxed);
}

/// 64-bit LCG (Knuth's MMIX constants).
#[derive(Debug, Clone)]
pub struct Lcg(u64);

impl Lcg {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 32) as u32
    }

    pub fn below(&mut self, n: usize) -> usize {
        (self.next_u32() as usize) % n.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadConfig {
    pub threads: usize,
    pub ops_per_thread: usize,
    pub seed: u64,
    /// Conf string applied over the defaults.
    pub conf: String,
    /// Install a user hook with this interval before starting.
    pub hook_interval: Option<u64>,
    /// Flip the global slow path while the workers run.
    pub toggle_slow: bool,
    /// Live objects a worker keeps at most before it only frees.
    pub max_live: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops_per_thread: 10_000,
            seed: 0xC0FFEE,
            conf: String::new(),
            hook_interval: None,
            toggle_slow: false,
            max_live: 512,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadReport {
    pub thread: usize,
    pub allocs: u64,
    pub frees: u64,
    pub failed_allocs: u64,
    pub thread_allocated: u64,
    pub thread_deallocated: u64,
    pub peak: u64,
    pub next_alloc_event: u64,
    pub next_dalloc_event: u64,
    /// First few invariant violations seen, with the operation index.
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArenaSummary {
    pub nmalloc: u64,
    pub ndalloc: u64,
    pub nfills: u64,
    pub nflushes: u64,
    pub live_objects: u64,
    pub invalid_frees: u64,
    pub live_tcaches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadReport {
    pub seed: u64,
    pub threads: Vec<ThreadReport>,
    pub hook_calls: u64,
    pub slow_toggles: u64,
    pub stats_snapshots: u64,
    pub arena: ArenaSummary,
    pub lifecycle_records: usize,
    pub duration_ms: u64,
}

impl WorkloadReport {
    /// Fail if any worker saw an invariant violation, the byte counters do
    /// not balance or objects were left behind in an arena.
    pub fn check(&self) -> Result<(), HarnessError> {
        if let Some(v) = self.threads.iter().flat_map(|t| &t.violations).next() {
            return Err(HarnessError::Invariant(v.clone()));
        }
        if let Some(t) = self
            .threads
            .iter()
            .find(|t| t.thread_allocated != t.thread_deallocated)
        {
            return Err(HarnessError::Invariant(format!(
                "thread {}: allocated {} != deallocated {}",
                t.thread, t.thread_allocated, t.thread_deallocated
            )));
        }
        if self.arena.live_objects != 0 || self.arena.invalid_frees != 0 {
            return Err(HarnessError::Invariant(format!(
                "arena leak: {} live objects, {} invalid frees",
                self.arena.live_objects, self.arena.invalid_frees
            )));
        }
        if self.arena.live_tcaches != 0 {
            return Err(HarnessError::Invariant(format!(
                "{} tcaches still associated after teardown",
                self.arena.live_tcaches
            )));
        }
        Ok(())
    }
}

const MAX_REPORTED_VIOLATIONS: usize = 8;

fn run_worker(tsd: &mut Tsd, thread: usize, cfg: &WorkloadConfig) -> ThreadReport {
    let mut rng = Lcg::new(cfg.seed ^ ((thread as u64 + 1) << 32));
    let mut live: Vec<(usize, usize)> = Vec::with_capacity(cfg.max_live);
    let mut report = ThreadReport {
        thread,
        ..ThreadReport::default()
    };
    for op in 0..cfg.ops_per_thread {
        let free = !live.is_empty() && (live.len() >= cfg.max_live || rng.below(5) < 2);
        if free {
            let (ptr, size) = live.swap_remove(rng.below(live.len()));
            tsd.dealloc(ptr, size);
            report.frees += 1;
        } else {
            let size = SIZE_MIX[rng.below(SIZE_MIX.len())];
            match tsd.alloc(size) {
                Some(ptr) => {
                    live.push((ptr, size));
                    report.allocs += 1;
                }
                None => report.failed_allocs += 1,
            }
        }
        if let Err(violation) = tsd.assert_invariants() {
            if report.violations.len() < MAX_REPORTED_VIOLATIONS {
                report.violations.push(format!("thread {thread} op {op}: {violation}"));
            }
        }
    }
    report.peak = tsd.peak_read();
    for (ptr, size) in live {
        tsd.dealloc(ptr, size);
        report.frees += 1;
    }
    report.thread_allocated = tsd.thread_allocated();
    report.thread_deallocated = tsd.thread_deallocated();
    report.next_alloc_event = tsd.event_context(Direction::Alloc).next_event;
    report.next_dalloc_event = tsd.event_context(Direction::Dalloc).next_event;
    report
}

/// Run `cfg` to completion. Returns the report along with every lifecycle
/// record the runtime kept.
pub fn run_workload(cfg: &WorkloadConfig) -> Result<(WorkloadReport, Vec<LifecycleRecord>), HarnessError> {
    let options = TcacheOptions::from_conf_str(&cfg.conf)?;
    let runtime = RuntimeBuilder::new(options).build();
    let started = Instant::now();
    let hook_calls_before = HOOK_CALLS.load(Ordering::Relaxed);

    let mut registrar = Tsd::new(runtime.clone());
    if let Some(interval) = cfg.hook_interval {
        registrar.register_user_event(UserHook {
            callback: Some(count_hook),
            interval,
            alloc_only: false,
        })?;
    }

    let start = Arc::new(Barrier::new(cfg.threads + 1));
    let done = Arc::new(AtomicBool::new(false));
    let toggler = cfg.toggle_slow.then(|| {
        let runtime = runtime.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut toggles = 0u64;
            loop {
                runtime.global_slow_inc();
                thread::yield_now();
                runtime.global_slow_dec();
                toggles += 1;
                if done.load(Ordering::Relaxed) {
                    break toggles;
                }
            }
        })
    });

    let workers: Vec<_> = (0..cfg.threads)
        .map(|thread| {
            let runtime = runtime.clone();
            let start = start.clone();
            let cfg = cfg.clone();
            thread::spawn(move || {
                let mut tsd = Tsd::new(runtime);
                start.wait();
                run_worker(&mut tsd, thread, &cfg)
            })
        })
        .collect();
    start.wait();

    let mut reports = Vec::with_capacity(cfg.threads);
    let mut panicked = None;
    for (thread, worker) in workers.into_iter().enumerate() {
        match worker.join() {
            Ok(report) => reports.push(report),
            Err(_) => panicked = panicked.or(Some(thread)),
        }
    }
    done.store(true, Ordering::Relaxed);
    let slow_toggles = toggler.map_or(0, |t| t.join().unwrap_or(0));
    drop(registrar);
    if let Some(thread) = panicked {
        return Err(HarnessError::WorkerPanicked(thread));
    }

    let mut arena = ArenaSummary::default();
    for stats in runtime.arenas().iter().map(|a| a.stats()) {
        arena.nmalloc += stats.nmalloc;
        arena.ndalloc += stats.ndalloc;
        arena.nfills += stats.nfills;
        arena.nflushes += stats.nflushes;
        arena.live_objects += stats.live_objects();
        arena.invalid_frees += stats.invalid_frees;
        arena.live_tcaches += stats.live_tcaches;
    }
    let records = runtime.drain_lifecycle_logs();
    let report = WorkloadReport {
        seed: cfg.seed,
        threads: reports,
        hook_calls: HOOK_CALLS.load(Ordering::Relaxed).saturating_sub(hook_calls_before),
        slow_toggles,
        stats_snapshots: runtime.stats_snapshots(),
        arena,
        lifecycle_records: records.len(),
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    Ok((report, records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lcg_is_deterministic() {
        let mut a = Lcg::new(7);
        let mut b = Lcg::new(7);
        let xs: Vec<_> = (0..16).map(|_| a.next_u32()).collect();
        let ys: Vec<_> = (0..16).map(|_| b.next_u32()).collect();
        assert_eq!(xs, ys);
        assert!(xs.windows(2).any(|w| w[0] != w[1]));
        assert_eq!(Lcg::new(1).below(0), 0);
    }

    #[test]
    fn single_thread_run_balances() {
        let cfg = WorkloadConfig {
            threads: 1,
            ops_per_thread: 2_000,
            ..WorkloadConfig::default()
        };
        let (report, records) = run_workload(&cfg).unwrap();
        report.check().unwrap();
        assert_eq!(report.threads.len(), 1);
        let t = &report.threads[0];
        assert_eq!(t.allocs, t.frees);
        assert_eq!(t.failed_allocs, 0);
        assert!(t.peak > 0);
        assert_eq!(report.lifecycle_records, records.len());
        assert!(records.iter().any(|r| r.symbol == "runtime_boot"));
    }

    #[test]
    fn same_seed_reproduces_byte_counts() {
        let cfg = WorkloadConfig {
            threads: 2,
            ops_per_thread: 1_500,
            seed: 99,
            ..WorkloadConfig::default()
        };
        let (a, _) = run_workload(&cfg).unwrap();
        let (b, _) = run_workload(&cfg).unwrap();
        let bytes = |r: &WorkloadReport| -> Vec<_> {
            r.threads.iter().map(|t| (t.thread_allocated, t.allocs)).collect()
        };
        assert_eq!(bytes(&a), bytes(&b));
    }

    #[test]
    fn bad_conf_is_a_config_error() {
        let cfg = WorkloadConfig {
            conf: "tcache_max:lots".into(),
            ..WorkloadConfig::default()
        };
        assert!(matches!(run_workload(&cfg), Err(HarnessError::Config(_))));
    }

    #[test]
    fn check_flags_unbalanced_threads() {
        let report = WorkloadReport {
            threads: vec![ThreadReport {
                thread: 3,
                thread_allocated: 64,
                ..ThreadReport::default()
            }],
            ..WorkloadReport::default()
        };
        let err = report.check().unwrap_err();
        assert!(err.to_string().contains("thread 3"));
    }
}
