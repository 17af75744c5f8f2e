//! Runtime tunables for the thread cache and the thread-event scheduler.
//!
//! Options are read from the `HOTBIN_CONF` environment variable on the first
//! call to [`options`] and cached for the life of the process. The syntax is a
//! malloc-conf style list of comma-separated `key:value` pairs:
//!
//! ```text
//! HOTBIN_CONF="tcache_max:65536,tcache_gc_incr_bytes:131072,experimental_tcache_gc:false"
//! ```
//!
//! Per-bin capacity overrides use the bin-settings syntax
//! `start-end:count[|start-end:count...]`, for example
//! `tcache_ncached_max:1-128:64|1025-4096:0`.
//!
//! Callers that need isolated settings (tests, harness workloads) build a
//! [`TcacheOptions`] directly or through [`TcacheOptions::from_conf_str`].

use std::sync::OnceLock;

use thiserror::Error;

/// Environment variable holding the conf string.
pub const CONF_ENV: &str = "HOTBIN_CONF";

/// Errors produced while parsing a conf string or a bin-settings string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown option `{0}`")]
    UnknownKey(String),
    #[error("invalid value `{value}` for option `{key}`")]
    InvalidValue { key: String, value: String },
    #[error("malformed conf segment `{0}` (expected `key:value`)")]
    MalformedPair(String),
    #[error("malformed bin setting `{0}` (expected `start-end:count`)")]
    MalformedBinSetting(String),
}

/// Severity threshold for lifecycle records.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// One `start-end:count` segment of a bin-settings string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinSetting {
    pub size_start: usize,
    pub size_end: usize,
    pub ncached_max: usize,
}

/// Parse a bin-settings string such as `1-128:64|1025-4096:0`.
///
/// Range validation against size-class limits is left to the consumer; this
/// only checks the syntax. An empty string yields no settings.
pub fn parse_bin_settings(s: &str) -> Result<Vec<BinSetting>, ConfigError> {
    let mut out = Vec::new();
    for segment in s.split('|') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let malformed = || ConfigError::MalformedBinSetting(segment.to_string());
        let (range, count) = segment.split_once(':').ok_or_else(malformed)?;
        let (start, end) = range.split_once('-').ok_or_else(malformed)?;
        let size_start = start.trim().parse::<usize>().map_err(|_| malformed())?;
        let size_end = end.trim().parse::<usize>().map_err(|_| malformed())?;
        let ncached_max = count.trim().parse::<usize>().map_err(|_| malformed())?;
        out.push(BinSetting {
            size_start,
            size_end,
            ncached_max,
        });
    }
    Ok(out)
}

/// Thread cache and event scheduler tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcacheOptions {
    /// Whether new threads start with a tcache.
    pub tcache: bool,
    /// Largest size class cached by default.
    pub tcache_max: usize,
    pub tcache_nslots_small_min: u32,
    pub tcache_nslots_small_max: u32,
    pub tcache_nslots_large: u32,
    /// Small bins hold `slab_nregs << lg_tcache_nslots_mul` items (shift right
    /// when negative), before clamping.
    pub lg_tcache_nslots_mul: i32,
    /// Allocation/deallocation bytes between incremental GC events. Zero
    /// disables the GC event.
    pub tcache_gc_incr_bytes: u64,
    /// Legacy GC only: bytes of flush demand to accumulate before a small bin
    /// is actually flushed.
    pub tcache_gc_delay_bytes: usize,
    pub lg_tcache_flush_small_div: u32,
    pub lg_tcache_flush_large_div: u32,
    /// Batched, time-spaced, locality-aware GC. When off, GC visits one bin
    /// per event and honours `tcache_gc_delay_bytes`.
    pub experimental_tcache_gc: bool,
    /// Per-bin capacity overrides.
    pub tcache_ncached_max: Vec<BinSetting>,
    /// Bytes of allocation between stats snapshots; negative disables.
    pub stats_interval: i64,
    /// Enables the profiling threshold event with a `1 << n` byte interval.
    pub lg_prof_threshold: Option<u32>,
    /// Stash freed pointers aligned to `1 << n` for a deferred
    /// write-after-free check; negative disables.
    pub lg_san_uaf_align: i32,
    pub narenas: usize,
    pub max_explicit_tcaches: usize,
    pub log_level: LogLevel,
    pub log_capacity: usize,
}

impl Default for TcacheOptions {
    fn default() -> Self {
        Self {
            tcache: true,
            tcache_max: 1 << 15,
            tcache_nslots_small_min: 20,
            tcache_nslots_small_max: 200,
            tcache_nslots_large: 20,
            lg_tcache_nslots_mul: 1,
            tcache_gc_incr_bytes: 65536,
            tcache_gc_delay_bytes: 0,
            lg_tcache_flush_small_div: 1,
            lg_tcache_flush_large_div: 1,
            experimental_tcache_gc: true,
            tcache_ncached_max: Vec::new(),
            stats_interval: -1,
            lg_prof_threshold: None,
            lg_san_uaf_align: -1,
            narenas: 4,
            max_explicit_tcaches: 4093,
            log_level: LogLevel::Debug,
            log_capacity: 4096,
        }
    }
}

const STATS_INTERVAL_ACCUM_LG_BATCH_SIZE: u32 = 6;
const STATS_INTERVAL_ACCUM_BATCH_MAX: u64 = 4 << 20;

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

impl TcacheOptions {
    /// Defaults overridden by a conf string.
    pub fn from_conf_str(conf: &str) -> Result<Self, ConfigError> {
        let mut opts = Self::default();
        opts.apply_conf_str(conf)?;
        Ok(opts)
    }

    /// Apply `key:value` pairs on top of the current values. Stops at the
    /// first error; pairs before it stay applied.
    pub fn apply_conf_str(&mut self, conf: &str) -> Result<(), ConfigError> {
        for pair in conf.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once(':')
                .ok_or_else(|| ConfigError::MalformedPair(pair.to_string()))?;
            self.apply(key.trim(), value.trim())?;
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "tcache" => self.tcache = parse_bool(key, value)?,
            "tcache_max" => self.tcache_max = parse_num(key, value)?,
            "tcache_nslots_small_min" => self.tcache_nslots_small_min = parse_num(key, value)?,
            "tcache_nslots_small_max" => self.tcache_nslots_small_max = parse_num(key, value)?,
            "tcache_nslots_large" => self.tcache_nslots_large = parse_num(key, value)?,
            "lg_tcache_nslots_mul" => self.lg_tcache_nslots_mul = parse_num(key, value)?,
            "tcache_gc_incr_bytes" => self.tcache_gc_incr_bytes = parse_num(key, value)?,
            "tcache_gc_delay_bytes" => self.tcache_gc_delay_bytes = parse_num(key, value)?,
            "lg_tcache_flush_small_div" => {
                self.lg_tcache_flush_small_div = parse_num(key, value)?;
            }
            "lg_tcache_flush_large_div" => {
                self.lg_tcache_flush_large_div = parse_num(key, value)?;
            }
            "experimental_tcache_gc" => self.experimental_tcache_gc = parse_bool(key, value)?,
            "tcache_ncached_max" => self.tcache_ncached_max = parse_bin_settings(value)?,
            "stats_interval" => self.stats_interval = parse_num(key, value)?,
            "lg_prof_threshold" => {
                let lg: u32 = parse_num(key, value)?;
                if lg >= 63 {
                    return Err(invalid(key, value));
                }
                self.lg_prof_threshold = Some(lg);
            }
            "lg_san_uaf_align" => self.lg_san_uaf_align = parse_num(key, value)?,
            "narenas" => {
                let n: usize = parse_num(key, value)?;
                if n == 0 {
                    return Err(invalid(key, value));
                }
                self.narenas = n;
            }
            "max_explicit_tcaches" => self.max_explicit_tcaches = parse_num(key, value)?,
            "log_level" => {
                self.log_level = LogLevel::parse(value).ok_or_else(|| invalid(key, value))?;
            }
            "log_capacity" => self.log_capacity = parse_num(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Whether the tcache GC event is enabled at all.
    #[must_use]
    pub const fn tcache_gc_enabled(&self) -> bool {
        self.tcache_gc_incr_bytes > 0
    }

    /// Whether the stats-interval event is enabled.
    #[must_use]
    pub const fn stats_interval_enabled(&self) -> bool {
        self.stats_interval >= 0
    }

    /// Per-thread byte batch between stats-interval checks.
    #[must_use]
    pub fn stats_interval_accum_batch(&self) -> u64 {
        if self.stats_interval < 0 {
            return 0;
        }
        let batch = (self.stats_interval as u64) >> STATS_INTERVAL_ACCUM_LG_BATCH_SIZE;
        batch.clamp(1, STATS_INTERVAL_ACCUM_BATCH_MAX)
    }

    /// Byte interval of the profiling threshold event, if enabled.
    #[must_use]
    pub fn prof_threshold_bytes(&self) -> Option<u64> {
        self.lg_prof_threshold.map(|lg| 1u64 << lg)
    }
}

static OPTIONS: OnceLock<(TcacheOptions, Option<ConfigError>)> = OnceLock::new();

/// Options from an optional conf string. A conf string that fails to parse
/// keeps the pairs before the bad one and returns the error alongside.
#[must_use]
pub fn load_conf(conf: Option<&str>) -> (TcacheOptions, Option<ConfigError>) {
    let mut opts = TcacheOptions::default();
    let err = conf.and_then(|conf| opts.apply_conf_str(conf).err());
    (opts, err)
}

fn loaded() -> &'static (TcacheOptions, Option<ConfigError>) {
    OPTIONS.get_or_init(|| load_conf(std::env::var(CONF_ENV).ok().as_deref()))
}

/// Process-wide options, read from [`CONF_ENV`] on first use.
///
/// The parse error, if any, is not fatal; see [`options_error`].
pub fn options() -> &'static TcacheOptions {
    &loaded().0
}

/// Why [`CONF_ENV`] was only partly applied, if it was.
pub fn options_error() -> Option<&'static ConfigError> {
    loaded().1.as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_conf_keeps_the_error_and_earlier_pairs() {
        let (opts, err) = load_conf(Some("tcache_max:4096,bogus:1,narenas:9"));
        assert_eq!(opts.tcache_max, 4096);
        assert_eq!(opts.narenas, TcacheOptions::default().narenas);
        assert_eq!(err, Some(ConfigError::UnknownKey("bogus".into())));
        assert_eq!(load_conf(None), (TcacheOptions::default(), None));
        assert_eq!(load_conf(Some("")).1, None);
    }

    #[test]
    fn defaults_match_documented_values() {
        let opts = TcacheOptions::default();
        assert!(opts.tcache);
        assert_eq!(opts.tcache_max, 32 * 1024);
        assert_eq!(opts.tcache_gc_incr_bytes, 65536);
        assert_eq!(opts.lg_tcache_nslots_mul, 1);
        assert!(opts.experimental_tcache_gc);
        assert!(!opts.stats_interval_enabled());
        assert_eq!(opts.stats_interval_accum_batch(), 0);
        assert_eq!(opts.prof_threshold_bytes(), None);
    }

    #[test]
    fn conf_string_overrides_selected_keys() {
        let opts = TcacheOptions::from_conf_str(
            "tcache_max:65536, tcache_gc_incr_bytes:4096,experimental_tcache_gc:false,log_level:WARN",
        )
        .unwrap();
        assert_eq!(opts.tcache_max, 65536);
        assert_eq!(opts.tcache_gc_incr_bytes, 4096);
        assert!(!opts.experimental_tcache_gc);
        assert_eq!(opts.log_level, LogLevel::Warn);
        assert_eq!(opts.tcache_nslots_large, 20);
    }

    #[test]
    fn conf_string_errors_are_distinguished() {
        assert_eq!(
            TcacheOptions::from_conf_str("bogus:1"),
            Err(ConfigError::UnknownKey("bogus".into()))
        );
        assert!(matches!(
            TcacheOptions::from_conf_str("tcache:yes"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            TcacheOptions::from_conf_str("tcache_max"),
            Err(ConfigError::MalformedPair(_))
        ));
        assert!(matches!(
            TcacheOptions::from_conf_str("narenas:0"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn bin_settings_parse_inside_conf_string() {
        let opts =
            TcacheOptions::from_conf_str("tcache_ncached_max:1-128:64|1025-4096:0,tcache:true")
                .unwrap();
        assert_eq!(
            opts.tcache_ncached_max,
            vec![
                BinSetting {
                    size_start: 1,
                    size_end: 128,
                    ncached_max: 64
                },
                BinSetting {
                    size_start: 1025,
                    size_end: 4096,
                    ncached_max: 0
                },
            ]
        );
    }

    #[test]
    fn bin_settings_reject_malformed_segments() {
        assert!(parse_bin_settings("").unwrap().is_empty());
        assert!(matches!(
            parse_bin_settings("1-128"),
            Err(ConfigError::MalformedBinSetting(_))
        ));
        assert!(matches!(
            parse_bin_settings("128:4"),
            Err(ConfigError::MalformedBinSetting(_))
        ));
        assert!(matches!(
            parse_bin_settings("a-b:c"),
            Err(ConfigError::MalformedBinSetting(_))
        ));
    }

    #[test]
    fn stats_batch_is_clamped() {
        let mut opts = TcacheOptions {
            stats_interval: 0,
            ..TcacheOptions::default()
        };
        assert_eq!(opts.stats_interval_accum_batch(), 1);
        opts.stats_interval = 1 << 20;
        assert_eq!(opts.stats_interval_accum_batch(), (1 << 20) >> 6);
        opts.stats_interval = i64::MAX;
        assert_eq!(opts.stats_interval_accum_batch(), 4 << 20);
    }

    #[test]
    fn log_level_parse_is_case_insensitive() {
        assert_eq!(LogLevel::parse("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("loud"), None);
        assert!(LogLevel::Trace < LogLevel::Error);
    }
}
