//! Per-bin view of a configuration: class size, slab geometry and the
//! capacity a fresh thread cache would get.

use hotbin_core::malloc::tcache;
use hotbin_core::size_class::{self, TCACHE_MAXCLASS_LIMIT, TCACHE_NBINS_MAX};
use hotbin_membrane::TcacheOptions;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinRow {
    pub binind: usize,
    pub size: usize,
    pub small: bool,
    pub nregs: u32,
    pub slab_size: usize,
    /// Capacity before overrides.
    pub computed_ncached_max: u16,
    pub ncached_max: u16,
    /// Whether `tcache_max` enables the bin.
    pub enabled: bool,
}

#[must_use]
pub fn bin_table(opts: &TcacheOptions) -> Vec<BinRow> {
    let info = tcache::default_bin_info(opts);
    let nbins = size_class::nbins_for_max(opts.tcache_max.min(TCACHE_MAXCLASS_LIMIT));
    (0..TCACHE_NBINS_MAX)
        .map(|binind| {
            let geometry = size_class::bin_info(binind);
            BinRow {
                binind,
                size: size_class::index2size(binind),
                small: size_class::is_small(binind),
                nregs: geometry.nregs,
                slab_size: geometry.slab_size,
                computed_ncached_max: tcache::ncached_max_compute(binind, opts),
                ncached_max: info[binind].ncached_max,
                enabled: binind < nbins,
            }
        })
        .collect()
}

/// Fixed-width text rendering, one line per bin.
#[must_use]
pub fn render_bin_table(rows: &[BinRow]) -> String {
    let mut out = String::from("binind       size  kind  nregs  slab_size  computed  ncached_max  enabled\n");
    for row in rows {
        out.push_str(&format!(
            "{:>6} {:>10}  {:<5} {:>5} {:>10} {:>9} {:>12}  {}\n",
            row.binind,
            row.size,
            if row.small { "small" } else { "large" },
            row.nregs,
            row.slab_size,
            row.computed_ncached_max,
            row.ncached_max,
            if row.enabled { "yes" } else { "no" },
        ));
    }
    out
}
