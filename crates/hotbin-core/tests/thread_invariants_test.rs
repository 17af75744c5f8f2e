//! Integration test: event counter invariants under concurrent threads.
//!
//! Worker threads run a seeded mixed workload and check their counters after
//! every operation while the main thread toggles the global slow path and
//! runs with a hook installed by another thread.
//!
//! Run: cargo test -p hotbin-core --test thread_invariants_test

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use hotbin_core::{Arena, Direction, RuntimeBuilder, SimArena, Tsd, UserHook};
use hotbin_membrane::TcacheOptions;

const THREADS: usize = 4;
const OPS: usize = 20_000;

static HOOK_CALLS: AtomicU64 = AtomicU64::new(0);

fn counting_hook(_: bool, _: u64, _: u64) {
    HOOK_CALLS.fetch_add(1, Ordering::Relaxed);
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

const SIZES: [usize; 8] = [8, 24, 64, 200, 1024, 3000, 16 << 10, 40 << 10];

#[test]
fn counters_stay_consistent_across_threads() {
    let arena = Arc::new(SimArena::new(0));
    let rt = RuntimeBuilder::new(
        TcacheOptions::from_conf_str("tcache_gc_incr_bytes:8192,stats_interval:65536").unwrap(),
    )
    .arena(arena.clone())
    .build();
    let start = Arc::new(Barrier::new(THREADS + 1));
    let done = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let rt = rt.clone();
            let start = start.clone();
            thread::spawn(move || {
                let mut tsd = Tsd::new(rt);
                let mut rng = Lcg(0x5eed + t as u64);
                let mut live: Vec<(usize, usize)> = Vec::new();
                start.wait();
                for op in 0..OPS {
                    let free = !live.is_empty() && rng.next() % 5 < 2;
                    if free {
                        let idx = (rng.next() as usize) % live.len();
                        let (p, size) = live.swap_remove(idx);
                        tsd.dealloc(p, size);
                    } else {
                        let size = SIZES[(rng.next() as usize) % SIZES.len()];
                        live.push((tsd.alloc(size).expect("simulated arena never runs dry"), size));
                    }
                    if let Err(violation) = tsd.assert_invariants() {
                        panic!("thread {t} op {op}: {violation}");
                    }
                }
                for (p, size) in live {
                    tsd.dealloc(p, size);
                }
                assert_eq!(tsd.assert_invariants(), Ok(()));
                let alloc = tsd.event_context(Direction::Alloc);
                assert!(alloc.current_bytes >= alloc.last_event);
                (tsd.thread_allocated(), tsd.thread_deallocated())
            })
        })
        .collect();

    let toggler = {
        let rt = rt.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut toggles = 0u64;
            loop {
                rt.global_slow_inc();
                thread::yield_now();
                rt.global_slow_dec();
                toggles += 1;
                if done.load(Ordering::Relaxed) {
                    break toggles;
                }
            }
        })
    };

    let mut registrar = Tsd::new(rt.clone());
    registrar
        .register_user_event(UserHook {
            callback: Some(counting_hook),
            interval: 4096,
            alloc_only: false,
        })
        .unwrap();
    start.wait();

    let totals: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    done.store(true, Ordering::Relaxed);
    assert!(toggler.join().unwrap() > 0);
    assert_eq!(rt.global_slow(), 0);
    drop(registrar);

    for (allocated, deallocated) in totals {
        assert_eq!(allocated, deallocated);
        assert!(allocated > 0);
    }
    assert!(HOOK_CALLS.load(Ordering::Relaxed) > 0);
    let stats = arena.stats();
    assert_eq!(stats.live_objects(), 0);
    assert_eq!(stats.invalid_frees, 0);
    assert_eq!(stats.live_tcaches, 0);
    assert_eq!(rt.nominal_threads(), 0);
}
