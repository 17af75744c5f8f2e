//! Thread cache: a per-thread array of cache bins plus the cold state that
//! the GC event drives.
//!
//! Hot data (bin metadata and the single backing slot block) lives directly
//! in [`ThreadCache`]; fill controllers, flush-delay counters, GC cursors and
//! the arena link live in a boxed [`ThreadCacheSlow`].
//!
//! The GC comes in two flavours. The legacy flavour visits one bin per event
//! and honours a per-bin flush delay. The batched flavour runs at most once
//! per [`TCACHE_GC_INTERVAL_NS`], visits several bins per pass and, for
//! small bins, prefers to evict pointers that are far from the arena's
//! current slab.

use std::sync::Arc;

use hotbin_membrane::config::{BinSetting, TcacheOptions};
use hotbin_membrane::nstime::{self, Clock, NSEC_PER_MSEC};

use crate::error::TcacheError;
use crate::log::{LifecycleLog, LifecycleRecord, LogLevel};
use crate::malloc::arena::Arena;
use crate::malloc::cache_bin::{CACHE_BIN_NCACHED_MAX, CacheBin, CacheBinInfo, CacheBinMut};
use crate::size_class::{
    self, SC_NBINS, TCACHE_MAXCLASS_LIMIT, TCACHE_NBINS_MAX, is_small,
};

/// Half-width of the address neighbourhood considered local during GC.
pub const TCACHE_GC_NEIGHBOR_LIMIT: usize = 2 << 20;
/// Minimum spacing between batched GC passes.
pub const TCACHE_GC_INTERVAL_NS: u64 = 10 * NSEC_PER_MSEC;
/// Small bins that may flush in one batched pass.
pub const TCACHE_GC_SMALL_NBINS_MAX: usize = if SC_NBINS >> 3 == 0 { 1 } else { SC_NBINS >> 3 };
/// Large bins that may flush in one batched pass.
pub const TCACHE_GC_LARGE_NBINS_MAX: usize = if (TCACHE_NBINS_MAX - SC_NBINS) >> 3 == 0 {
    1
} else {
    (TCACHE_NBINS_MAX - SC_NBINS) >> 3
};

/// Per-small-bin fill-size controller. The effective lg fill divisor is
/// `base - offset`; `base` moves with GC feedback, `offset` with bursts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillControl {
    base: u8,
    offset: u8,
}

impl Default for FillControl {
    fn default() -> Self {
        Self { base: 1, offset: 0 }
    }
}

impl FillControl {
    #[must_use]
    pub const fn base(&self) -> u8 {
        self.base
    }

    #[must_use]
    pub const fn offset(&self) -> u8 {
        self.offset
    }

    /// Effective lg fill divisor; the burst offset only applies to the batched GC.
    #[must_use]
    pub const fn lg_div(&self, batched: bool) -> u8 {
        if batched { self.base - self.offset } else { self.base }
    }

    /// Grow the next fill after a refill.
    pub fn burst_prepare(&mut self) {
        if self.offset + 1 < self.base {
            self.offset += 1;
        }
    }

    pub fn burst_reset(&mut self) {
        self.offset = 0;
    }

    /// GC feedback. `limit == 0` asks for larger fills; a non-zero `limit`
    /// (the bin capacity) asks for smaller ones while keeping fills >= 1.
    pub fn gc_update(&mut self, limit: u16) {
        if limit == 0 && self.base > 1 {
            self.base -= 1;
        } else if limit != 0 && (u32::from(limit) >> self.base) > 1 {
            self.base += 1;
        }
        self.offset = 0;
    }
}

/// Tunables a thread cache reads on its slow paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcacheTunables {
    pub lg_flush_small_div: u32,
    pub lg_flush_large_div: u32,
    pub experimental_gc: bool,
    pub gc_delay_bytes: usize,
    pub lg_san_uaf_align: Option<u32>,
}

impl TcacheTunables {
    #[must_use]
    pub fn from_options(opts: &TcacheOptions) -> Self {
        Self {
            lg_flush_small_div: opts.lg_tcache_flush_small_div.clamp(1, 16),
            lg_flush_large_div: opts.lg_tcache_flush_large_div.clamp(1, 16),
            experimental_gc: opts.experimental_tcache_gc,
            gc_delay_bytes: opts.tcache_gc_delay_bytes,
            lg_san_uaf_align: u32::try_from(opts.lg_san_uaf_align)
                .ok()
                .filter(|lg| *lg < usize::BITS),
        }
    }
}

impl Default for TcacheTunables {
    fn default() -> Self {
        Self::from_options(&TcacheOptions::default())
    }
}

/// Shared services a thread cache needs besides its arena.
#[derive(Clone)]
pub struct TcacheContext {
    pub tunables: TcacheTunables,
    pub clock: Arc<dyn Clock>,
    pub log: Arc<LifecycleLog>,
}

impl std::fmt::Debug for TcacheContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcacheContext")
            .field("tunables", &self.tunables)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Bin capacity computation
// ---------------------------------------------------------------------------

/// Default capacity of bin `binind` under `opts`, ignoring overrides.
#[must_use]
pub fn ncached_max_compute(binind: usize, opts: &TcacheOptions) -> u16 {
    if !is_small(binind) {
        return opts
            .tcache_nslots_large
            .min(u32::from(CACHE_BIN_NCACHED_MAX)) as u16;
    }
    let slab_nregs = u64::from(size_class::bin_info(binind).nregs);
    let mut min = u64::from(opts.tcache_nslots_small_min);
    let mut max = u64::from(opts.tcache_nslots_small_max).min(u64::from(CACHE_BIN_NCACHED_MAX));
    if min % 2 != 0 {
        min += 1;
    }
    if max % 2 != 0 {
        max -= 1;
    }
    min = min.max(2);
    max = max.max(2);
    min = min.min(max);

    let mul = opts.lg_tcache_nslots_mul;
    let mut candidate = if mul < 0 {
        slab_nregs >> mul.unsigned_abs().min(63)
    } else {
        slab_nregs << mul.unsigned_abs().min(32)
    };
    if candidate % 2 != 0 {
        candidate += 1;
    }
    candidate.clamp(min, max) as u16
}

/// Apply `start-end:count` overrides to `info`. Ends above the tcache limit
/// are clamped; segments starting above it or with `start > end` are
/// ignored; counts are clamped to the bin maximum.
pub fn apply_bin_settings(info: &mut [CacheBinInfo; TCACHE_NBINS_MAX], settings: &[BinSetting]) {
    for setting in settings {
        let end = setting.size_end.min(TCACHE_MAXCLASS_LIMIT);
        if setting.size_start > TCACHE_MAXCLASS_LIMIT || setting.size_start > end {
            continue;
        }
        let (Some(first), Some(last)) = (
            size_class::size2index(setting.size_start),
            size_class::size2index(end),
        ) else {
            continue;
        };
        let ncached_max = setting
            .ncached_max
            .min(usize::from(CACHE_BIN_NCACHED_MAX)) as u16;
        for bin in &mut info[first..=last] {
            *bin = CacheBinInfo::new(ncached_max);
        }
    }
}

/// Capacities for every bin: computed defaults overlaid with the configured
/// `tcache_ncached_max` overrides.
#[must_use]
pub fn default_bin_info(opts: &TcacheOptions) -> [CacheBinInfo; TCACHE_NBINS_MAX] {
    let mut info = [CacheBinInfo::default(); TCACHE_NBINS_MAX];
    for (binind, bin) in info.iter_mut().enumerate() {
        *bin = CacheBinInfo::new(ncached_max_compute(binind, opts));
    }
    apply_bin_settings(&mut info, &opts.tcache_ncached_max);
    info
}

fn gc_item_delay(binind: usize, gc_delay_bytes: usize) -> u8 {
    (gc_delay_bytes / size_class::index2size(binind)).min(usize::from(u8::MAX)) as u8
}

#[inline]
fn is_remote(ptr: usize, min: usize, max: usize) -> bool {
    ptr < min || ptr >= max
}

/// Count pointers outside the slab at `addr` and outside its 2 MiB
/// neighbourhood. Returns the count to act on along with the local range: the
/// neighbourhood when it alone yields enough flush candidates, else the slab.
fn gc_small_nremote(cached: &[usize], addr: usize, slab_size: usize, nflush: usize) -> (usize, usize, usize) {
    let slab_min = addr;
    let slab_max = addr.saturating_add(slab_size);
    let neighbor_min = addr.saturating_sub(TCACHE_GC_NEIGHBOR_LIMIT);
    let neighbor_max = addr.saturating_add(TCACHE_GC_NEIGHBOR_LIMIT);

    let mut n_remote_slab = 0;
    let mut n_remote_neighbor = 0;
    for &ptr in cached {
        n_remote_slab += usize::from(is_remote(ptr, slab_min, slab_max));
        n_remote_neighbor += usize::from(is_remote(ptr, neighbor_min, neighbor_max));
    }
    if n_remote_neighbor >= nflush {
        (n_remote_neighbor, neighbor_min, neighbor_max)
    } else {
        (n_remote_slab, slab_min, slab_max)
    }
}

fn bin_view<'a>(bins: &'a mut [CacheBin], storage: &'a mut [usize], binind: usize) -> CacheBinMut<'a> {
    let bin = &mut bins[binind];
    let window = bin.window();
    CacheBinMut {
        slots: &mut storage[window],
        bin,
    }
}

// ---------------------------------------------------------------------------
// Thread cache
// ---------------------------------------------------------------------------

/// Cold per-tcache state.
pub struct ThreadCacheSlow {
    id: u64,
    arena: Arc<dyn Arena>,
    fill_ctl: [FillControl; SC_NBINS],
    bin_refilled: [bool; SC_NBINS],
    bin_flush_delay_items: [u8; SC_NBINS],
    next_gc_bin: usize,
    next_gc_bin_small: usize,
    next_gc_bin_large: usize,
    last_gc_time: Option<u64>,
    nbins: usize,
    uaf_detected: u64,
}

pub struct ThreadCache {
    bins: Box<[CacheBin]>,
    storage: Box<[usize]>,
    slow: Box<ThreadCacheSlow>,
    ctx: TcacheContext,
}

impl ThreadCache {
    /// Build a tcache caching the first `nbins` classes with capacities from
    /// `info`, and associate it with `arena`.
    pub fn new(
        id: u64,
        info: &[CacheBinInfo; TCACHE_NBINS_MAX],
        nbins: usize,
        arena: Arc<dyn Arena>,
        ctx: TcacheContext,
    ) -> Result<Self, TcacheError> {
        let nbins = nbins.clamp(1, TCACHE_NBINS_MAX);
        let total: usize = info[..nbins].iter().map(|i| usize::from(i.ncached_max)).sum();
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(total)
            .map_err(|_| TcacheError::OutOfMemory { slots: total })?;
        storage.resize(total, 0);

        let mut offset = 0;
        let bins: Box<[CacheBin]> = info
            .iter()
            .enumerate()
            .map(|(binind, bi)| {
                if binind < nbins {
                    let bin = CacheBin::new(offset, *bi);
                    offset += usize::from(bi.ncached_max);
                    bin
                } else {
                    CacheBin::disabled(*bi)
                }
            })
            .collect();
        debug_assert_eq!(offset, total);

        let gc_delay_bytes = ctx.tunables.gc_delay_bytes;
        let slow = Box::new(ThreadCacheSlow {
            id,
            arena,
            fill_ctl: [FillControl::default(); SC_NBINS],
            bin_refilled: [false; SC_NBINS],
            bin_flush_delay_items: std::array::from_fn(|binind| gc_item_delay(binind, gc_delay_bytes)),
            next_gc_bin: 0,
            next_gc_bin_small: 0,
            next_gc_bin_large: SC_NBINS,
            last_gc_time: None,
            nbins,
            uaf_detected: 0,
        });
        slow.arena.tcache_associate(id);
        ctx.log.push_with(LogLevel::Debug, || {
            LifecycleRecord::new(LogLevel::Debug, "tcache_create", "create", "ok")
                .with_tcache(id)
                .with_count(total)
                .with_details(format!("nbins={nbins};arena={}", slow.arena.ind()))
        });
        Ok(Self {
            bins,
            storage: storage.into_boxed_slice(),
            slow,
            ctx,
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.slow.id
    }

    /// Number of bins enabled by the tcache maximum.
    #[must_use]
    pub fn nbins(&self) -> usize {
        self.slow.nbins
    }

    #[must_use]
    pub fn arena(&self) -> &Arc<dyn Arena> {
        &self.slow.arena
    }

    #[must_use]
    pub fn bin(&self, binind: usize) -> &CacheBin {
        &self.bins[binind]
    }

    /// Effective capacity, zero for disabled bins.
    #[must_use]
    pub fn ncached_max(&self, binind: usize) -> u16 {
        self.bins[binind].ncached_max()
    }

    /// Capacity of every bin, including disabled ones, for carrying across a
    /// reinit.
    #[must_use]
    pub fn bin_settings(&self) -> [CacheBinInfo; TCACHE_NBINS_MAX] {
        std::array::from_fn(|binind| self.bins[binind].info())
    }

    #[must_use]
    pub fn fill_control(&self, binind: usize) -> FillControl {
        self.slow.fill_ctl[binind]
    }

    #[must_use]
    pub fn bin_refilled(&self, binind: usize) -> bool {
        self.slow.bin_refilled[binind]
    }

    #[must_use]
    pub fn flush_delay_items(&self, binind: usize) -> u8 {
        self.slow.bin_flush_delay_items[binind]
    }

    /// Stashed pointers that failed the write-after-free check.
    #[must_use]
    pub fn uaf_detected(&self) -> u64 {
        self.slow.uaf_detected
    }

    #[must_use]
    pub fn total_cached(&self) -> usize {
        self.bins
            .iter()
            .map(|b| usize::from(b.ncached()) + usize::from(b.nstashed()))
            .sum()
    }

    #[inline]
    fn uaf_aligned(&self, ptr: usize) -> bool {
        self.ctx
            .tunables
            .lg_san_uaf_align
            .is_some_and(|lg| ptr & ((1usize << lg) - 1) == 0)
    }

    /// Pop from the bin without refilling.
    #[inline]
    pub fn alloc_easy(&mut self, binind: usize) -> Option<usize> {
        let mut bin = bin_view(&mut self.bins, &mut self.storage, binind);
        let ptr = bin.alloc()?;
        bin.bin.nrequests += 1;
        Some(ptr)
    }

    /// Allocate one object of class `binind`: from the bin, after a refill
    /// for small classes, or straight from the arena for large classes and
    /// disabled bins. `None` only when the arena is exhausted.
    pub fn alloc(&mut self, binind: usize) -> Option<usize> {
        if self.bins[binind].is_disabled() {
            return self.alloc_direct(binind);
        }
        if let Some(ptr) = self.alloc_easy(binind) {
            return Some(ptr);
        }
        if is_small(binind) {
            return self.alloc_small_hard(binind);
        }
        let ptr = self.alloc_direct(binind)?;
        self.bins[binind].nrequests += 1;
        Some(ptr)
    }

    fn alloc_direct(&self, binind: usize) -> Option<usize> {
        let mut out = [0usize; 1];
        (self.slow.arena.alloc_range(binind, &mut out, 1) == 1).then_some(out[0])
    }

    fn alloc_small_hard(&mut self, binind: usize) -> Option<usize> {
        self.flush_stashed(binind, true);
        let batched = self.ctx.tunables.experimental_gc;
        let lg_div = self.slow.fill_ctl[binind].lg_div(batched);
        let ncached_max = usize::from(self.bins[binind].ncached_max());
        let nfill = (ncached_max >> lg_div).max(1);
        let nfill_min = if batched { (nfill >> 1) + 1 } else { nfill };

        let arena = &self.slow.arena;
        let mut bin = bin_view(&mut self.bins, &mut self.storage, binind);
        let filled = bin.fill(nfill, |out| arena.alloc_range(binind, out, nfill_min.min(out.len())));

        self.slow.bin_refilled[binind] = true;
        self.slow.fill_ctl[binind].burst_prepare();
        let id = self.slow.id;
        if filled == 0 {
            self.ctx.log.push(
                LifecycleRecord::new(LogLevel::Warn, "tcache_fill", "fill", "arena_exhausted")
                    .with_tcache(id)
                    .with_bin(binind),
            );
            return None;
        }
        self.ctx.log.push_with(LogLevel::Trace, || {
            LifecycleRecord::new(LogLevel::Trace, "tcache_fill", "fill", "ok")
                .with_tcache(id)
                .with_bin(binind)
                .with_count(filled)
                .with_details(format!("nfill_min={nfill_min};nfill_max={nfill};lg_div={lg_div}"))
        });
        self.alloc_easy(binind)
    }

    /// Push onto the bin if that needs no further work.
    #[inline]
    pub fn dalloc_easy(&mut self, binind: usize, ptr: usize) -> bool {
        if is_small(binind) && self.uaf_aligned(ptr) {
            return false;
        }
        bin_view(&mut self.bins, &mut self.storage, binind).dalloc(ptr)
    }

    /// Free one object of class `binind`, flushing a full bin first.
    pub fn dalloc(&mut self, binind: usize, ptr: usize) {
        if self.bins[binind].is_disabled() {
            self.slow.arena.free_batch(binind, &[ptr]);
            return;
        }
        let stash = is_small(binind) && self.uaf_aligned(ptr);
        let push = |tc: &mut Self| {
            let mut bin = bin_view(&mut tc.bins, &mut tc.storage, binind);
            if stash { bin.stash(ptr) } else { bin.dalloc(ptr) }
        };
        if push(self) {
            return;
        }
        self.flush_full(binind);
        if !push(self) {
            self.slow.arena.free_batch(binind, &[ptr]);
        }
    }

    fn flush_full(&mut self, binind: usize) {
        let lg_div = if is_small(binind) {
            self.ctx.tunables.lg_flush_small_div
        } else {
            self.ctx.tunables.lg_flush_large_div
        };
        let rem = usize::from(self.bins[binind].ncached_max()) >> lg_div;
        let flushed = self.flush_to(binind, rem);
        let id = self.slow.id;
        self.ctx.log.push_with(LogLevel::Debug, || {
            LifecycleRecord::new(LogLevel::Debug, "tcache_flush", "bin_full", "flushed")
                .with_tcache(id)
                .with_bin(binind)
                .with_count(flushed)
                .with_details(format!("rem={rem}"))
        });
    }

    /// Return the stash to the arena, verifying it first.
    fn flush_stashed(&mut self, binind: usize, small: bool) {
        if self.bins[binind].nstashed() == 0 {
            return;
        }
        let arena = &self.slow.arena;
        let mut bin = bin_view(&mut self.bins, &mut self.storage, binind);
        let (nstashed, corrupted) = bin.flush_stashed(|ptrs| {
            let corrupted = arena.check_stashed(binind, ptrs);
            arena.free_batch(binind, ptrs);
            (ptrs.len(), corrupted)
        });
        let id = self.slow.id;
        for ptr in &corrupted {
            self.ctx.log.push(
                LifecycleRecord::new(LogLevel::Error, "tcache_stash", "write_after_free", "detected")
                    .with_tcache(id)
                    .with_bin(binind)
                    .with_details(format!("ptr={ptr:#x}")),
            );
        }
        self.slow.uaf_detected += corrupted.len() as u64;
        self.ctx.log.push_with(LogLevel::Trace, || {
            LifecycleRecord::new(LogLevel::Trace, "tcache_stash", "flush_stashed", "ok")
                .with_tcache(id)
                .with_bin(binind)
                .with_count(nstashed)
                .with_details(format!("small={small}"))
        });
    }

    /// Flush bin `binind` down to `rem` cached items (stashed items always
    /// go). Returns the number of cached items flushed.
    pub fn flush_to(&mut self, binind: usize, rem: usize) -> usize {
        if self.bins[binind].is_disabled() {
            return 0;
        }
        let small = is_small(binind);
        if small {
            self.slow.fill_ctl[binind].burst_reset();
        }
        self.flush_stashed(binind, small);

        let arena = &self.slow.arena;
        let mut bin = bin_view(&mut self.bins, &mut self.storage, binind);
        let ncached = usize::from(bin.bin.ncached());
        let nflush = ncached - rem.min(ncached);
        if nflush > 0 {
            bin.flush_bottom(nflush, |ptrs| arena.free_batch(binind, ptrs));
        }
        nflush
    }

    /// Empty every enabled bin.
    pub fn flush_all(&mut self) {
        for binind in 0..self.slow.nbins {
            self.flush_to(binind, 0);
        }
    }

    fn take_requests(&mut self) -> Vec<(usize, u64)> {
        self.bins
            .iter_mut()
            .enumerate()
            .filter(|(_, b)| b.nrequests > 0)
            .map(|(binind, b)| (binind, std::mem::take(&mut b.nrequests)))
            .collect()
    }

    /// Merge per-bin request counts into the arena and reset them.
    pub fn stats_merge(&mut self) {
        let requests = self.take_requests();
        if !requests.is_empty() {
            self.slow.arena.stats_merge(&requests);
        }
    }

    // -----------------------------------------------------------------------
    // GC
    // -----------------------------------------------------------------------

    /// GC one bin. Returns whether anything was flushed.
    pub fn gc_bin(&mut self, binind: usize) -> bool {
        if self.bins[binind].is_disabled() {
            return false;
        }
        let small = is_small(binind);
        self.flush_stashed(binind, small);
        let flushed = if small {
            self.gc_small(binind)
        } else {
            self.gc_large(binind)
        };
        bin_view(&mut self.bins, &mut self.storage, binind).reset_low_water();
        flushed
    }

    fn gc_small(&mut self, binind: usize) -> bool {
        let bin = &self.bins[binind];
        let ncached = usize::from(bin.ncached());
        let low_water = usize::from(bin.low_water());
        let ncached_max = bin.ncached_max();

        if low_water > 0 {
            self.slow.fill_ctl[binind].gc_update(ncached_max);
        } else if self.slow.bin_refilled[binind] {
            self.slow.fill_ctl[binind].gc_update(0);
            self.slow.bin_refilled[binind] = false;
        }

        let id = self.slow.id;
        let mut nflush = low_water - (low_water >> 2);
        let mut nremote = 0;
        if !self.ctx.tunables.experimental_gc {
            let delay = &mut self.slow.bin_flush_delay_items[binind];
            if nflush < usize::from(*delay) {
                *delay -= nflush as u8;
                let left = *delay;
                self.ctx.log.push_with(LogLevel::Trace, || {
                    LifecycleRecord::new(LogLevel::Trace, "tcache_gc", "gc_small", "delayed")
                        .with_tcache(id)
                        .with_bin(binind)
                        .with_details(format!("delay_items={left}"))
                });
                return false;
            }
            *delay = gc_item_delay(binind, self.ctx.tunables.gc_delay_bytes);
        } else if nflush != ncached {
            let arena = &self.slow.arena;
            if let Some(addr) = arena.current_slab_addr(binind) {
                let slab_size = arena.slab_size(binind);
                let mut bin = bin_view(&mut self.bins, &mut self.storage, binind);
                let (remote, min, max) = gc_small_nremote(bin.cached(), addr, slab_size, nflush);
                nremote = remote;
                nflush = nflush.max(nremote);
                debug_assert!(nflush < ncached || nremote == ncached);
                if nremote != 0 && nremote != ncached {
                    bin.partition_remote(nremote, |ptr| is_remote(ptr, min, max));
                }
            }
        }

        if nflush == 0 {
            debug_assert_eq!(low_water, 0);
            return false;
        }
        self.flush_to(binind, ncached - nflush);
        self.ctx.log.push_with(LogLevel::Debug, || {
            LifecycleRecord::new(LogLevel::Debug, "tcache_gc", "gc_small", "flushed")
                .with_tcache(id)
                .with_bin(binind)
                .with_count(nflush)
                .with_details(format!("low_water={low_water};nremote={nremote}"))
        });
        true
    }

    fn gc_large(&mut self, binind: usize) -> bool {
        let bin = &self.bins[binind];
        let low_water = usize::from(bin.low_water());
        if low_water == 0 {
            return false;
        }
        let rem = usize::from(bin.ncached()) - low_water + (low_water >> 2);
        let flushed = self.flush_to(binind, rem);
        let id = self.slow.id;
        self.ctx.log.push_with(LogLevel::Debug, || {
            LifecycleRecord::new(LogLevel::Debug, "tcache_gc", "gc_large", "flushed")
                .with_tcache(id)
                .with_bin(binind)
                .with_count(flushed)
                .with_details(format!("low_water={low_water}"))
        });
        true
    }

    /// Body of the tcache GC event.
    pub fn gc_event(&mut self) {
        let nbins = self.slow.nbins;
        if !self.ctx.tunables.experimental_gc {
            let binind = self.slow.next_gc_bin.min(nbins - 1);
            self.gc_bin(binind);
            self.slow.next_gc_bin = if binind + 1 == nbins { 0 } else { binind + 1 };
            return;
        }

        let now = self.ctx.clock.now_ns();
        let too_soon = self
            .slow
            .last_gc_time
            .is_some_and(|last| nstime::elapsed_ns(last, now) < TCACHE_GC_INTERVAL_NS);
        if too_soon {
            return;
        }
        self.slow.last_gc_time = Some(now);

        let small_nbins = nbins.min(SC_NBINS);
        let mut gc_small_nbins = 0;
        let mut binind = self.slow.next_gc_bin_small.min(small_nbins - 1);
        for _ in 0..small_nbins {
            if gc_small_nbins >= TCACHE_GC_SMALL_NBINS_MAX {
                break;
            }
            if self.gc_bin(binind) {
                gc_small_nbins += 1;
            }
            binind += 1;
            if binind == small_nbins {
                binind = 0;
            }
        }
        self.slow.next_gc_bin_small = binind;

        if nbins <= SC_NBINS {
            return;
        }
        let mut gc_large_nbins = 0;
        let mut binind = self.slow.next_gc_bin_large.clamp(SC_NBINS, nbins - 1);
        for _ in SC_NBINS..nbins {
            if gc_large_nbins >= TCACHE_GC_LARGE_NBINS_MAX {
                break;
            }
            if self.gc_bin(binind) {
                gc_large_nbins += 1;
            }
            binind += 1;
            if binind == nbins {
                binind = SC_NBINS;
            }
        }
        self.slow.next_gc_bin_large = binind;
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        self.flush_all();
        let requests = self.take_requests();
        let id = self.slow.id;
        self.slow.arena.tcache_dissociate(id, &requests);
        self.ctx.log.push_with(LogLevel::Debug, || {
            LifecycleRecord::new(LogLevel::Debug, "tcache_destroy", "destroy", "ok").with_tcache(id)
        });
    }
}

impl std::fmt::Debug for ThreadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCache")
            .field("id", &self.slow.id)
            .field("nbins", &self.slow.nbins)
            .field("arena", &self.slow.arena.ind())
            .field("cached", &self.total_cached())
            .finish_non_exhaustive()
    }
}
