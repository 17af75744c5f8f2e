//! Integration test: thread cache lifecycle against a shared arena.
//!
//! Thread teardown, explicit tcache handles and per-thread controls must
//! leave the arena with exactly the objects the caller still holds.
//!
//! Run: cargo test -p hotbin-core --test tcache_lifecycle_test

use std::sync::Arc;

use hotbin_core::malloc::SlotState;
use hotbin_core::malloc::tcache::ncached_max_compute;
use hotbin_core::size_class::size2index;
use hotbin_core::{Arena, Runtime, RuntimeBuilder, SimArena, TcacheError, TcachesError, Tsd};
use hotbin_membrane::TcacheOptions;

fn runtime_on(conf: &str, arena: &Arc<SimArena>) -> Arc<Runtime> {
    RuntimeBuilder::new(TcacheOptions::from_conf_str(conf).unwrap())
        .arena(arena.clone())
        .build()
}

#[test]
fn thread_teardown_returns_every_cached_object() {
    let arena = Arc::new(SimArena::new(0));
    let rt = runtime_on("", &arena);
    let mut tsd = Tsd::new(rt.clone());
    assert_eq!(arena.stats().live_tcaches, 1);

    let sizes = [8usize, 48, 160, 1024, 4096, 20000];
    let mut ptrs = Vec::new();
    for round in 0..50 {
        for &size in &sizes {
            ptrs.push((tsd.alloc(size).unwrap(), size));
        }
        if round % 3 == 0 {
            for (p, size) in ptrs.drain(..) {
                tsd.dealloc(p, size);
            }
        }
    }
    for (p, size) in ptrs.drain(..) {
        tsd.dealloc(p, size);
    }
    assert!(tsd.tcache().unwrap().total_cached() > 0);
    drop(tsd);

    let stats = arena.stats();
    assert_eq!(stats.live_objects(), 0);
    assert_eq!(stats.invalid_frees, 0);
    assert_eq!(stats.live_tcaches, 0);
    assert!(stats.total_requests() > 0, "requests merge on dissociate");
}

#[test]
fn explicit_flush_keeps_caller_objects_live() {
    let arena = Arc::new(SimArena::new(0));
    let rt = runtime_on("", &arena);
    let mut tsd = Tsd::new(rt.clone());
    let held: Vec<_> = (0..10).map(|_| tsd.alloc(96).unwrap()).collect();
    let spare = tsd.alloc(96).unwrap();
    tsd.dealloc(spare, 96);
    tsd.flush();
    assert_eq!(tsd.tcache().unwrap().total_cached(), 0);
    assert_eq!(arena.stats().live_objects(), held.len() as u64);
    for p in held {
        assert!(arena.owns_live(size2index(96).unwrap(), p));
        tsd.dealloc(p, 96);
    }
}

#[test]
fn explicit_handles_are_reused_and_validated() {
    let arena = Arc::new(SimArena::new(0));
    let rt = runtime_on("max_explicit_tcaches:2", &arena);
    let mut tsd = Tsd::new(rt.clone());

    let a = rt.tcaches_create().unwrap();
    let b = rt.tcaches_create().unwrap();
    let c = rt.tcaches_create().unwrap();
    assert_eq!((a, b, c), (0, 1, 2));
    assert_eq!(rt.tcaches_create(), Err(TcachesError::Full));

    let p = tsd.alloc_explicit(b, 256).unwrap().unwrap();
    tsd.dealloc_explicit(b, p, 256).unwrap();
    assert_eq!(tsd.thread_allocated(), 256);
    assert_eq!(tsd.thread_deallocated(), 256);

    rt.tcaches_flush(b).unwrap();
    assert_eq!(rt.tcaches().slot_state(b), SlotState::NeedsReinit);
    assert!(tsd.alloc_explicit(b, 256).unwrap().is_some());
    assert_eq!(rt.tcaches().slot_state(b), SlotState::Live);

    rt.tcaches_destroy(a).unwrap();
    assert_eq!(tsd.alloc_explicit(a, 8), Err(TcachesError::InvalidHandle(a)));
    assert_eq!(rt.tcaches_destroy(a), Err(TcachesError::InvalidHandle(a)));
    assert_eq!(rt.tcaches_create(), Ok(a));

    let errors: Vec<_> = rt
        .drain_lifecycle_logs()
        .into_iter()
        .filter(|r| r.symbol == "tcaches" && r.outcome == "error")
        .map(|r| r.event)
        .collect();
    assert_eq!(errors, ["create", "destroy"]);
}

#[test]
fn tcache_controls_round_trip_through_rebuilds() {
    let arena = Arc::new(SimArena::new(0));
    let rt = runtime_on("tcache_ncached_max:8-64:12", &arena);
    let mut tsd = Tsd::new(rt.clone());
    assert_eq!(tsd.ncached_max_read(8), Ok(12));
    assert_eq!(tsd.ncached_max_read(64), Ok(12));
    assert_ne!(tsd.ncached_max_read(80), Ok(12));

    let before = tsd.tcache().unwrap().id();
    tsd.ncached_max_write("80-80:3").unwrap();
    assert_ne!(tsd.tcache().unwrap().id(), before, "write rebuilds the tcache");
    assert_eq!(tsd.ncached_max_read(80), Ok(3));
    assert_eq!(tsd.ncached_max_read(8), Ok(12));
    assert_eq!(arena.stats().live_tcaches, 1);

    assert_eq!(
        tsd.ncached_max_read(16 << 20),
        Err(TcacheError::SizeTooLarge(16 << 20))
    );

    tsd.set_tcache_enabled(false);
    assert!(tsd.tcache().is_none());
    assert_eq!(arena.stats().live_tcaches, 0);
    assert_eq!(tsd.ncached_max_read(8), Ok(0));
    tsd.set_tcache_enabled(true);
    assert_eq!(tsd.ncached_max_read(8), Ok(12), "re-enable uses runtime defaults");
    let default_80 = ncached_max_compute(size2index(80).unwrap(), rt.options());
    assert_eq!(tsd.ncached_max_read(80), Ok(default_80));
}

#[test]
fn stashed_frees_are_checked_before_reuse() {
    let arena = Arc::new(SimArena::new(0));
    let rt = runtime_on("lg_san_uaf_align:0", &arena);
    let mut tsd = Tsd::new(rt.clone());
    let p = tsd.alloc(128).unwrap();
    tsd.dealloc(p, 128);
    arena.simulate_write_after_free(p);
    tsd.flush();
    assert_eq!(tsd.tcache().unwrap().uaf_detected(), 1);
    let logs = rt.drain_lifecycle_logs();
    assert!(
        logs.iter()
            .any(|r| r.symbol == "tcache_stash" && r.event == "write_after_free")
    );
}
