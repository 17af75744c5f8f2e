//! Size-class table.
//!
//! Classes follow a quantum-spaced start (8, 16, 32, 48, 64) and then four
//! classes per doubling. With 4 KiB pages the first 36 classes are small
//! (slab backed, up to 14 KiB); the rest are large, up to the 8 MiB tcache
//! limit. Only the classes a cache bin can hold are tabulated.

pub const LG_PAGE: u32 = 12;
pub const PAGE: usize = 1 << LG_PAGE;

/// Number of small (slab-backed) size classes.
pub const SC_NBINS: usize = 36;
/// Largest small size class.
pub const SMALL_MAXCLASS: usize = 14336;
/// Upper bound for any cacheable size class.
pub const TCACHE_MAXCLASS_LIMIT: usize = 8 << 20;
/// Number of size classes up to and including [`TCACHE_MAXCLASS_LIMIT`].
pub const TCACHE_NBINS_MAX: usize = 73;
/// Largest size class the wider allocator can hand out (64-bit layout).
pub const SC_LARGE_MAXCLASS: u64 = 7 << 60;

const fn compute_sizes() -> [usize; TCACHE_NBINS_MAX] {
    let mut out = [0usize; TCACHE_NBINS_MAX];
    out[0] = 8;
    out[1] = 16;
    out[2] = 32;
    out[3] = 48;
    out[4] = 64;
    let mut i = 5;
    let mut base = 64;
    while i < TCACHE_NBINS_MAX {
        let delta = base / 4;
        let mut k = 1;
        while k <= 4 && i < TCACHE_NBINS_MAX {
            out[i] = base + k * delta;
            i += 1;
            k += 1;
        }
        base *= 2;
    }
    out
}

const fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Smallest page multiple that holds a whole number of regions.
const fn compute_slab_size(size: usize) -> usize {
    PAGE / gcd(PAGE, size) * size
}

static SIZES: [usize; TCACHE_NBINS_MAX] = compute_sizes();

/// Slab geometry of a small size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinInfo {
    pub reg_size: usize,
    pub slab_size: usize,
    pub nregs: u32,
}

/// Byte size of class `ind`.
#[inline]
#[must_use]
pub fn index2size(ind: usize) -> usize {
    SIZES[ind]
}

/// Class index for a request of `size` bytes, `None` above the limit.
#[must_use]
pub fn size2index(size: usize) -> Option<usize> {
    if size > TCACHE_MAXCLASS_LIMIT {
        return None;
    }
    Some(SIZES.partition_point(|&class| class < size))
}

/// Usable size for a request: the size rounded up to its class.
#[must_use]
pub fn s2u(size: usize) -> Option<usize> {
    size2index(size).map(index2size)
}

#[inline]
#[must_use]
pub const fn is_small(ind: usize) -> bool {
    ind < SC_NBINS
}

/// Slab geometry for small class `ind`. Large classes are treated as a
/// single region spanning the whole allocation.
#[must_use]
pub fn bin_info(ind: usize) -> BinInfo {
    let reg_size = index2size(ind);
    if !is_small(ind) {
        return BinInfo {
            reg_size,
            slab_size: reg_size,
            nregs: 1,
        };
    }
    let slab_size = compute_slab_size(reg_size);
    BinInfo {
        reg_size,
        slab_size,
        nregs: (slab_size / reg_size) as u32,
    }
}

/// Number of cache bins enabled by a `tcache_max` of `max` bytes.
#[must_use]
pub fn nbins_for_max(max: usize) -> usize {
    size2index(max.min(TCACHE_MAXCLASS_LIMIT)).map_or(TCACHE_NBINS_MAX, |ind| ind + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_shape() {
        assert_eq!(index2size(0), 8);
        assert_eq!(index2size(4), 64);
        assert_eq!(index2size(5), 80);
        assert_eq!(index2size(SC_NBINS - 1), SMALL_MAXCLASS);
        assert_eq!(index2size(SC_NBINS), 16384);
        assert_eq!(index2size(TCACHE_NBINS_MAX - 1), TCACHE_MAXCLASS_LIMIT);
        assert!(SIZES.windows(2).all(|w| w[0] < w[1]), "sizes must be strictly increasing");
    }

    #[test]
    fn size_rounding() {
        assert_eq!(size2index(0), Some(0));
        assert_eq!(size2index(1), Some(0));
        assert_eq!(size2index(8), Some(0));
        assert_eq!(size2index(9), Some(1));
        assert_eq!(size2index(65), Some(5));
        assert_eq!(s2u(100), Some(112));
        assert_eq!(s2u(TCACHE_MAXCLASS_LIMIT), Some(TCACHE_MAXCLASS_LIMIT));
        assert_eq!(size2index(TCACHE_MAXCLASS_LIMIT + 1), None);
    }

    #[test]
    fn slab_geometry_divides_evenly() {
        for ind in 0..SC_NBINS {
            let info = bin_info(ind);
            assert_eq!(info.slab_size % PAGE, 0, "class {ind}");
            assert_eq!(info.slab_size, info.reg_size * info.nregs as usize, "class {ind}");
        }
        assert_eq!(bin_info(0).nregs, 512);
        let last = bin_info(SC_NBINS - 1);
        assert_eq!(last.slab_size, 7 * PAGE);
        assert_eq!(last.nregs, 2);
    }

    #[test]
    fn default_tcache_max_enables_41_bins() {
        assert_eq!(nbins_for_max(32 * 1024), 41);
        assert_eq!(nbins_for_max(TCACHE_MAXCLASS_LIMIT), TCACHE_NBINS_MAX);
        assert_eq!(nbins_for_max(0), 1);
    }
}
