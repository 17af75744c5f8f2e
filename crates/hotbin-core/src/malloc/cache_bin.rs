//! Fixed-capacity per-class pointer stacks.
//!
//! A thread cache owns one backing block of pointer slots; each bin owns the
//! window `[base, base + ncached_max)` inside it. Cached items grow up from
//! the bottom of the window (index 0 is the oldest and is flushed first, the
//! top is popped next). Stashed items, held back for a deferred
//! write-after-free check, grow down from the top of the window.
//!
//! `CacheBin` is the plain metadata; [`CacheBinMut`] pairs it with its slot
//! window for mutation.

/// Largest capacity a bin can be configured with.
pub const CACHE_BIN_NCACHED_MAX: u16 = u16::MAX;

/// Static capacity of a bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheBinInfo {
    pub ncached_max: u16,
}

impl CacheBinInfo {
    #[must_use]
    pub const fn new(ncached_max: u16) -> Self {
        Self { ncached_max }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheBin {
    base: usize,
    /// Capacity as configured, kept even when the bin is disabled so it can
    /// be carried across a reinit.
    info: CacheBinInfo,
    enabled: bool,
    ncached: u16,
    nstashed: u16,
    low_water: u16,
    pub(crate) nrequests: u64,
}

impl CacheBin {
    pub(crate) fn new(base: usize, info: CacheBinInfo) -> Self {
        Self {
            base,
            info,
            enabled: info.ncached_max > 0,
            ..Self::default()
        }
    }

    /// A bin that fails every alloc and free but remembers `info`.
    pub(crate) fn disabled(info: CacheBinInfo) -> Self {
        Self {
            info,
            ..Self::default()
        }
    }

    #[inline]
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        !self.enabled
    }

    #[must_use]
    pub fn info(&self) -> CacheBinInfo {
        self.info
    }

    /// Effective capacity: zero for a disabled bin.
    #[inline]
    #[must_use]
    pub fn ncached_max(&self) -> u16 {
        if self.enabled { self.info.ncached_max } else { 0 }
    }

    #[inline]
    #[must_use]
    pub fn ncached(&self) -> u16 {
        self.ncached
    }

    #[inline]
    #[must_use]
    pub fn nstashed(&self) -> u16 {
        self.nstashed
    }

    #[inline]
    #[must_use]
    pub fn low_water(&self) -> u16 {
        self.low_water
    }

    #[must_use]
    pub fn nrequests(&self) -> u64 {
        self.nrequests
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.ncached + self.nstashed >= self.ncached_max()
    }

    pub(crate) fn window(&self) -> std::ops::Range<usize> {
        self.base..self.base + usize::from(self.ncached_max())
    }
}

/// A bin together with its slot window.
pub struct CacheBinMut<'a> {
    pub(crate) bin: &'a mut CacheBin,
    pub(crate) slots: &'a mut [usize],
}

impl CacheBinMut<'_> {
    #[inline]
    fn cap(&self) -> usize {
        usize::from(self.bin.ncached_max())
    }

    /// Pop the top item, maintaining the low-water mark.
    #[inline]
    pub fn alloc(&mut self) -> Option<usize> {
        if self.bin.ncached == 0 {
            return None;
        }
        self.bin.ncached -= 1;
        if self.bin.ncached < self.bin.low_water {
            self.bin.low_water = self.bin.ncached;
        }
        Some(self.slots[usize::from(self.bin.ncached)])
    }

    /// Push onto the top. Fails when the bin is full.
    #[inline]
    pub fn dalloc(&mut self, ptr: usize) -> bool {
        if self.bin.is_full() {
            return false;
        }
        self.slots[usize::from(self.bin.ncached)] = ptr;
        self.bin.ncached += 1;
        true
    }

    /// Park `ptr` in the stash area. Fails when the bin is full.
    pub fn stash(&mut self, ptr: usize) -> bool {
        if self.bin.is_full() {
            return false;
        }
        let idx = self.cap() - usize::from(self.bin.nstashed) - 1;
        self.slots[idx] = ptr;
        self.bin.nstashed += 1;
        true
    }

    #[must_use]
    pub fn cached(&self) -> &[usize] {
        &self.slots[..usize::from(self.bin.ncached)]
    }

    #[must_use]
    pub fn stashed(&self) -> &[usize] {
        let cap = self.cap();
        &self.slots[cap - usize::from(self.bin.nstashed)..cap]
    }

    pub fn reset_low_water(&mut self) {
        self.bin.low_water = self.bin.ncached;
    }

    /// Fill an empty bin. `fill` receives the writable slots and returns how
    /// many it wrote.
    pub fn fill(&mut self, nfill_max: usize, fill: impl FnOnce(&mut [usize]) -> usize) -> usize {
        debug_assert_eq!(self.bin.ncached, 0);
        let room = self.cap() - usize::from(self.bin.nstashed);
        let n = nfill_max.min(room);
        let filled = fill(&mut self.slots[..n]).min(n);
        self.bin.ncached = filled as u16;
        filled
    }

    /// Hand the bottom `n` cached items to `flush`, then slide the survivors
    /// down.
    pub fn flush_bottom<R>(&mut self, n: usize, flush: impl FnOnce(&[usize]) -> R) -> R {
        let ncached = usize::from(self.bin.ncached);
        let n = n.min(ncached);
        let out = flush(&self.slots[..n]);
        self.slots.copy_within(n..ncached, 0);
        self.bin.ncached = (ncached - n) as u16;
        if self.bin.low_water > self.bin.ncached {
            self.bin.low_water = self.bin.ncached;
        }
        out
    }

    /// Hand every stashed item to `flush` and empty the stash.
    pub fn flush_stashed<R>(&mut self, flush: impl FnOnce(&[usize]) -> R) -> R {
        let out = flush(self.stashed());
        self.bin.nstashed = 0;
        out
    }

    /// Stable in-place partition that moves the `nremote` items matching
    /// `is_remote` to the bottom of the bin. Retained items end up above them
    /// in their original relative order; the order among remote items is
    /// unspecified. Requires `0 < nremote < ncached`.
    pub fn partition_remote(&mut self, nremote: usize, is_remote: impl Fn(usize) -> bool) {
        let ncached = usize::from(self.bin.ncached);
        debug_assert!(nremote > 0 && nremote < ncached);
        let ntop = ncached - nremote;
        let top = ncached - 1;
        let items = &mut self.slots[..ncached];

        // Positions are counted down from the top of the stack.
        let mut swap: Option<usize> = None;
        let mut cnt = 0;
        for cur in 0..ntop {
            if !is_remote(items[top - cur]) {
                cnt += 1;
                if let Some(s) = swap.as_mut() {
                    items.swap(top - cur, top - *s);
                    *s += 1;
                }
            } else if swap.is_none() {
                swap = Some(cur);
            }
        }
        for cur in ntop..ncached {
            if cnt == ntop {
                break;
            }
            if !is_remote(items[top - cur]) {
                items.swap(top - cur, top - cnt);
                cnt += 1;
            }
        }
        debug_assert_eq!(cnt, ntop);
    }
}
