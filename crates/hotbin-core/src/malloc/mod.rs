//! Thread caching.
//!
//! - [`arena`]: the global-allocator contract the cache fills from and
//!   flushes to, plus a simulated arena over a logical address space
//! - [`cache_bin`]: one fixed-capacity stack per size class
//! - [`tcache`]: the per-thread cache with fill, flush and incremental GC
//! - [`tcaches`]: caches addressed by handle rather than owned by a thread

pub mod arena;
pub mod cache_bin;
pub mod tcache;
pub mod tcaches;

pub use arena::{Arena, ArenaStats, SimArena};
pub use cache_bin::{CACHE_BIN_NCACHED_MAX, CacheBin, CacheBinInfo};
pub use tcache::{FillControl, TcacheContext, TcacheTunables, ThreadCache};
pub use tcaches::{ExplicitTcaches, SharedTcache, SlotState};
