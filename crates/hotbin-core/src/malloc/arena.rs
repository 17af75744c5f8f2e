//! Arena contract and a simulated slab arena.
//!
//! The thread cache only needs a handful of entry points from the wider
//! allocator: batch fill, batch flush, a locality hint, the deferred
//! write-after-free check and a place to merge its statistics. [`Arena`]
//! captures exactly that.
//!
//! [`SimArena`] implements the contract over a logical address space (no
//! real memory is touched), the same way the rest of this crate treats
//! pointers as plain `usize` offsets. Each arena owns a disjoint 1 TiB window
//! so pointers from different arenas never collide.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use hotbin_membrane::spin::Spin;
use parking_lot::{Mutex, MutexGuard};

use crate::size_class::{self, PAGE, SC_NBINS, TCACHE_NBINS_MAX};

/// Per-bin request counters reported by a thread cache: `(binind, nrequests)`.
pub type BinRequests = [(usize, u64)];

/// Aggregate counters exposed by an arena.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Objects handed out (fills plus direct allocations).
    pub nmalloc: u64,
    /// Objects returned.
    pub ndalloc: u64,
    pub nfills: u64,
    pub nflushes: u64,
    /// Tcache requests merged in, indexed by bin.
    pub nrequests: Vec<u64>,
    /// Frees of pointers the arena did not hand out (or already had back).
    pub invalid_frees: u64,
    /// Tcaches currently associated.
    pub live_tcaches: usize,
}

impl ArenaStats {
    #[must_use]
    pub fn live_objects(&self) -> u64 {
        self.nmalloc.saturating_sub(self.ndalloc)
    }

    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.nrequests.iter().sum()
    }
}

/// The global-allocator interface consumed by the thread cache.
pub trait Arena: Send + Sync {
    /// Arena index.
    fn ind(&self) -> usize;

    /// Fill `out` with objects of class `binind`, returning how many were
    /// written. Implementations write at least `nfill_min` objects unless
    /// memory is exhausted.
    fn alloc_range(&self, binind: usize, out: &mut [usize], nfill_min: usize) -> usize;

    /// Return a batch of objects of class `binind`.
    fn free_batch(&self, binind: usize, ptrs: &[usize]);

    /// A free this arena cannot have handed out, such as one whose size is
    /// above every class.
    fn invalid_free(&self, _ptr: usize) {}

    /// Base address of the slab the arena will allocate from next, if any.
    fn current_slab_addr(&self, binind: usize) -> Option<usize>;

    fn slab_size(&self, binind: usize) -> usize {
        size_class::bin_info(binind).slab_size
    }

    /// Verify stashed pointers were not written after free. Returns the
    /// pointers that failed the check.
    fn check_stashed(&self, _binind: usize, _ptrs: &[usize]) -> Vec<usize> {
        Vec::new()
    }

    fn tcache_associate(&self, tcache_id: u64);

    /// Unlink a tcache, merging its outstanding request counts.
    fn tcache_dissociate(&self, tcache_id: u64, requests: &BinRequests);

    fn stats_merge(&self, requests: &BinRequests);

    fn stats(&self) -> ArenaStats {
        ArenaStats::default()
    }
}

/// Size of each arena's logical address window.
const ARENA_WINDOW: usize = 1 << 40;

#[derive(Debug)]
struct Slab {
    /// Free region indices; popped from the back, lowest index last pushed.
    free: Vec<u32>,
    /// Allocation bitmap, one flag per region.
    allocated: Vec<bool>,
}

#[derive(Debug, Default)]
struct SimBin {
    slabs: BTreeMap<usize, Slab>,
    slabcur: Option<usize>,
    nonfull: BTreeSet<usize>,
}

impl SimBin {
    fn pick_slab(&mut self) -> Option<usize> {
        let cur_has_room = self
            .slabcur
            .and_then(|cur| self.slabs.get(&cur))
            .is_some_and(|s| !s.free.is_empty());
        if cur_has_room {
            return self.slabcur;
        }
        self.slabcur = self.nonfull.pop_first();
        self.slabcur
    }
}

#[derive(Debug, Default)]
struct Counters {
    nmalloc: u64,
    ndalloc: u64,
    nfills: u64,
    nflushes: u64,
    invalid_frees: u64,
    nrequests: Vec<u64>,
}

/// Deterministic slab arena over a logical address space.
pub struct SimArena {
    ind: usize,
    base: usize,
    cursor: AtomicUsize,
    bins: Box<[Mutex<SimBin>]>,
    large: Mutex<HashMap<usize, usize>>,
    tcaches: Mutex<Vec<u64>>,
    counters: Mutex<Counters>,
    corrupted: Mutex<HashSet<usize>>,
    contended: AtomicU64,
}

impl SimArena {
    #[must_use]
    pub fn new(ind: usize) -> Self {
        let base = (ind + 1).saturating_mul(ARENA_WINDOW);
        Self {
            ind,
            base,
            cursor: AtomicUsize::new(base),
            bins: (0..SC_NBINS).map(|_| Mutex::new(SimBin::default())).collect(),
            large: Mutex::new(HashMap::new()),
            tcaches: Mutex::new(Vec::new()),
            counters: Mutex::new(Counters {
                nrequests: vec![0; TCACHE_NBINS_MAX],
                ..Counters::default()
            }),
            corrupted: Mutex::new(HashSet::new()),
            contended: AtomicU64::new(0),
        }
    }

    /// First address of this arena's window.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Mark `ptr` as written after it was freed; the next stash check that
    /// sees it reports it.
    pub fn simulate_write_after_free(&self, ptr: usize) {
        self.corrupted.lock().insert(ptr);
    }

    /// Bin lock acquisitions that had to back off.
    #[must_use]
    pub fn contended_acquisitions(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }

    /// Whether `ptr` is currently handed out.
    #[must_use]
    pub fn owns_live(&self, binind: usize, ptr: usize) -> bool {
        if binind >= SC_NBINS {
            return self.large.lock().contains_key(&ptr);
        }
        let bin = self.bins[binind].lock();
        Self::locate(&bin, binind, ptr)
            .and_then(|(addr, reg)| bin.slabs.get(&addr).map(|s| s.allocated[reg]))
            .unwrap_or(false)
    }

    fn lock_bin(&self, binind: usize) -> MutexGuard<'_, SimBin> {
        let bin = &self.bins[binind];
        let mut spin = Spin::new();
        loop {
            if let Some(guard) = bin.try_lock() {
                return guard;
            }
            if spin.exhausted() {
                self.contended.fetch_add(1, Ordering::Relaxed);
                return bin.lock();
            }
            spin.adaptive();
        }
    }

    fn reserve(&self, size: usize, align: usize) -> usize {
        let mut cur = self.cursor.load(Ordering::Relaxed);
        loop {
            let start = cur.next_multiple_of(align);
            match self.cursor.compare_exchange_weak(
                cur,
                start + size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return start,
                Err(actual) => cur = actual,
            }
        }
    }

    fn new_slab(&self, bin: &mut SimBin, binind: usize) -> usize {
        let info = size_class::bin_info(binind);
        let addr = self.reserve(info.slab_size, PAGE);
        let nregs = info.nregs;
        bin.slabs.insert(
            addr,
            Slab {
                free: (0..nregs).rev().collect(),
                allocated: vec![false; nregs as usize],
            },
        );
        bin.slabcur = Some(addr);
        addr
    }

    fn locate(bin: &SimBin, binind: usize, ptr: usize) -> Option<(usize, usize)> {
        let info = size_class::bin_info(binind);
        let (&addr, _) = bin.slabs.range(..=ptr).next_back()?;
        let offset = ptr - addr;
        if offset >= info.slab_size || offset % info.reg_size != 0 {
            return None;
        }
        Some((addr, offset / info.reg_size))
    }

    fn fill_small(&self, binind: usize, out: &mut [usize]) -> usize {
        let info = size_class::bin_info(binind);
        let mut bin = self.lock_bin(binind);
        let mut filled = 0;
        while filled < out.len() {
            let addr = match bin.pick_slab() {
                Some(addr) => addr,
                None => self.new_slab(&mut bin, binind),
            };
            let Some(slab) = bin.slabs.get_mut(&addr) else {
                break;
            };
            while filled < out.len() {
                let Some(reg) = slab.free.pop() else {
                    break;
                };
                slab.allocated[reg as usize] = true;
                out[filled] = addr + reg as usize * info.reg_size;
                filled += 1;
            }
        }
        filled
    }

    fn free_small(&self, binind: usize, ptrs: &[usize]) -> (u64, u64) {
        let mut bin = self.lock_bin(binind);
        let (mut freed, mut invalid) = (0, 0);
        for &ptr in ptrs {
            let Some((addr, reg)) = Self::locate(&bin, binind, ptr) else {
                invalid += 1;
                continue;
            };
            let is_cur = bin.slabcur == Some(addr);
            let Some(slab) = bin.slabs.get_mut(&addr) else {
                invalid += 1;
                continue;
            };
            if !slab.allocated[reg] {
                invalid += 1;
                continue;
            }
            slab.allocated[reg] = false;
            let was_full = slab.free.is_empty();
            slab.free.push(reg as u32);
            freed += 1;
            let now_empty = slab.free.len() == slab.allocated.len();
            if now_empty && !is_cur {
                bin.slabs.remove(&addr);
                bin.nonfull.remove(&addr);
            } else if was_full && !is_cur {
                bin.nonfull.insert(addr);
            }
        }
        (freed, invalid)
    }
}

impl std::fmt::Debug for SimArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimArena")
            .field("ind", &self.ind)
            .field("base", &format_args!("{:#x}", self.base))
            .finish_non_exhaustive()
    }
}

impl Arena for SimArena {
    fn ind(&self) -> usize {
        self.ind
    }

    fn alloc_range(&self, binind: usize, out: &mut [usize], nfill_min: usize) -> usize {
        debug_assert!(nfill_min <= out.len());
        let filled = if binind < SC_NBINS {
            self.fill_small(binind, out)
        } else {
            let size = size_class::index2size(binind);
            let mut large = self.large.lock();
            for slot in out.iter_mut() {
                let addr = self.reserve(size, PAGE);
                large.insert(addr, binind);
                *slot = addr;
            }
            out.len()
        };
        let mut counters = self.counters.lock();
        counters.nmalloc += filled as u64;
        counters.nfills += 1;
        filled
    }

    fn free_batch(&self, binind: usize, ptrs: &[usize]) {
        if ptrs.is_empty() {
            return;
        }
        let (freed, invalid) = if binind < SC_NBINS {
            self.free_small(binind, ptrs)
        } else {
            let mut large = self.large.lock();
            let mut freed = 0;
            let mut invalid = 0;
            for ptr in ptrs {
                match large.remove(ptr) {
                    Some(ind) if ind == binind => freed += 1,
                    Some(ind) => {
                        large.insert(*ptr, ind);
                        invalid += 1;
                    }
                    None => invalid += 1,
                }
            }
            (freed, invalid)
        };
        let mut counters = self.counters.lock();
        counters.ndalloc += freed;
        counters.invalid_frees += invalid;
        counters.nflushes += 1;
    }

    fn invalid_free(&self, _ptr: usize) {
        self.counters.lock().invalid_frees += 1;
    }

    fn current_slab_addr(&self, binind: usize) -> Option<usize> {
        if binind >= SC_NBINS {
            return None;
        }
        let bin = self.lock_bin(binind);
        bin.slabcur.or_else(|| bin.nonfull.first().copied())
    }

    fn check_stashed(&self, _binind: usize, ptrs: &[usize]) -> Vec<usize> {
        let mut corrupted = self.corrupted.lock();
        if corrupted.is_empty() {
            return Vec::new();
        }
        ptrs.iter().copied().filter(|p| corrupted.remove(p)).collect()
    }

    fn tcache_associate(&self, tcache_id: u64) {
        self.tcaches.lock().push(tcache_id);
    }

    fn tcache_dissociate(&self, tcache_id: u64, requests: &BinRequests) {
        let mut tcaches = self.tcaches.lock();
        if let Some(pos) = tcaches.iter().position(|&id| id == tcache_id) {
            tcaches.swap_remove(pos);
        }
        self.stats_merge(requests);
    }

    fn stats_merge(&self, requests: &BinRequests) {
        let mut counters = self.counters.lock();
        for &(binind, n) in requests {
            if let Some(slot) = counters.nrequests.get_mut(binind) {
                *slot += n;
            }
        }
    }

    fn stats(&self) -> ArenaStats {
        let counters = self.counters.lock();
        ArenaStats {
            nmalloc: counters.nmalloc,
            ndalloc: counters.ndalloc,
            nfills: counters.nfills,
            nflushes: counters.nflushes,
            nrequests: counters.nrequests.clone(),
            invalid_frees: counters.invalid_frees,
            live_tcaches: self.tcaches.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_hands_out_distinct_aligned_regions() {
        let arena = SimArena::new(0);
        let mut out = [0usize; 64];
        let n = arena.alloc_range(4, &mut out, 33);
        assert_eq!(n, 64);
        let unique: HashSet<usize> = out.iter().copied().collect();
        assert_eq!(unique.len(), 64);
        assert!(out.iter().all(|p| p % 64 == 0 && *p >= arena.base()));
        assert!(out.iter().all(|&p| arena.owns_live(4, p)));
        assert_eq!(arena.stats().live_objects(), 64);
    }

    #[test]
    fn fill_prefers_current_slab_then_lowest_nonfull() {
        let arena = SimArena::new(0);
        let info = size_class::bin_info(SC_NBINS - 1);
        let mut first = vec![0usize; info.nregs as usize * 2];
        arena.alloc_range(SC_NBINS - 1, &mut first, 1);
        let slab_a = first[0];
        let slab_b = first[info.nregs as usize];
        assert_eq!(arena.current_slab_addr(SC_NBINS - 1), Some(slab_b));

        arena.free_batch(SC_NBINS - 1, &[slab_a]);
        let mut out = [0usize; 2];
        arena.alloc_range(SC_NBINS - 1, &mut out, 2);
        assert_eq!(out[0], slab_a, "nonfull slab reused after current fills");
    }

    #[test]
    fn double_and_foreign_frees_are_counted() {
        let arena = SimArena::new(1);
        let mut out = [0usize; 2];
        arena.alloc_range(0, &mut out, 2);
        arena.free_batch(0, &[out[0]]);
        arena.free_batch(0, &[out[0], 12345]);
        let stats = arena.stats();
        assert_eq!(stats.ndalloc, 1);
        assert_eq!(stats.invalid_frees, 2);
    }

    #[test]
    fn large_allocations_round_trip() {
        let arena = SimArena::new(0);
        let mut out = [0usize; 1];
        assert_eq!(arena.alloc_range(SC_NBINS, &mut out, 1), 1);
        assert!(arena.owns_live(SC_NBINS, out[0]));
        arena.free_batch(SC_NBINS + 1, &out);
        assert_eq!(arena.stats().invalid_frees, 1, "wrong class rejected");
        arena.free_batch(SC_NBINS, &out);
        assert!(!arena.owns_live(SC_NBINS, out[0]));
        assert_eq!(arena.stats().live_objects(), 0);
    }

    #[test]
    fn stash_check_reports_each_corruption_once() {
        let arena = SimArena::new(0);
        arena.simulate_write_after_free(0x40);
        assert_eq!(arena.check_stashed(0, &[0x10, 0x40]), vec![0x40]);
        assert!(arena.check_stashed(0, &[0x40]).is_empty());
    }

    #[test]
    fn association_tracks_live_tcaches_and_merges_requests() {
        let arena = SimArena::new(0);
        arena.tcache_associate(7);
        arena.tcache_associate(8);
        assert_eq!(arena.stats().live_tcaches, 2);
        arena.tcache_dissociate(7, &[(3, 10), (40, 2)]);
        let stats = arena.stats();
        assert_eq!(stats.live_tcaches, 1);
        assert_eq!(stats.nrequests[3], 10);
        assert_eq!(stats.total_requests(), 12);
    }
}
