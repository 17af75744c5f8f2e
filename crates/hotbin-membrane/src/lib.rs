//! # hotbin-membrane
//!
//! Ambient primitives shared by the hotbin crates: the tunables (`config`),
//! a monotonic clock seam (`nstime`) and adaptive backoff (`spin`).

pub mod config;
pub mod nstime;
pub mod spin;

pub use config::{
    BinSetting, ConfigError, LogLevel, TcacheOptions, load_conf, options, options_error,
    parse_bin_settings,
};
pub use nstime::{Clock, ManualClock, MonotonicClock};
pub use spin::Spin;
