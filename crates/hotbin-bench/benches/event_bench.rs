//! Event scheduler benchmarks.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use hotbin_core::event::scheduler::{min_wait, update_wait};
use hotbin_core::{RuntimeBuilder, Tsd, UserHook};
use hotbin_membrane::TcacheOptions;

fn noop_hook(_: bool, _: u64, _: u64) {}

fn bench_wait_math(c: &mut Criterion) {
    let mut group = c.benchmark_group("wait_math");

    let waits = [0u64, 4096, 65536, 1 << 20, 0, 0, 0, 2049, 300];
    group.bench_function("min_wait", |b| b.iter(|| min_wait(black_box(&waits))));

    group.bench_function("update_wait", |b| {
        let mut wait = 65536u64;
        b.iter(|| {
            let due = update_wait(&mut wait, black_box(512), true, || 4096, || 65536);
            black_box(due)
        });
    });
    group.finish();
}

fn bench_trigger_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("trigger_path");

    // Each iteration crosses a threshold, so every op takes the slow path.
    let opts = TcacheOptions::from_conf_str("tcache_gc_incr_bytes:64").expect("bench conf parses");
    let mut tsd = Tsd::new(RuntimeBuilder::new(opts).build());
    group.bench_function("gc_every_op", |b| {
        b.iter(|| {
            let p = tsd.alloc(64).expect("alloc");
            tsd.dealloc(p, 64);
        });
    });

    let mut tsd = Tsd::new(RuntimeBuilder::new(TcacheOptions::default()).build());
    for interval in [1024, 2048, 4096, 8192] {
        tsd.register_user_event(UserHook {
            callback: Some(noop_hook),
            interval,
            alloc_only: false,
        })
        .expect("hook registers");
    }
    group.bench_function("four_user_hooks", |b| {
        b.iter(|| {
            let p = tsd.alloc(256).expect("alloc");
            tsd.dealloc(p, 256);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_wait_math, bench_trigger_path);
criterion_main!(benches);
