//! Error types.

use hotbin_membrane::config::ConfigError;
use thiserror::Error;

use crate::event::Direction;

/// Errors from creating or reconfiguring a thread cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TcacheError {
    #[error("out of memory reserving {slots} cache bin slots")]
    OutOfMemory { slots: usize },
    #[error("size {0} exceeds the largest cacheable class")]
    SizeTooLarge(usize),
    #[error("thread cache is not available on this thread")]
    Unavailable,
    #[error("bad bin settings: {0}")]
    Settings(#[from] ConfigError),
}

/// Errors from the explicit tcache registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TcachesError {
    #[error("explicit tcache table is full")]
    Full,
    #[error("out of memory creating explicit tcache")]
    OutOfMemory,
    #[error("invalid explicit tcache handle {0}")]
    InvalidHandle(u32),
}

impl From<TcacheError> for TcachesError {
    fn from(_: TcacheError) -> Self {
        Self::OutOfMemory
    }
}

/// Errors from user event hook registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("hook needs a callback and a non-zero interval")]
    InvalidArgument,
    #[error("all user event slots are taken")]
    Full,
}

/// A broken relation among a thread's event counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("{direction}: next_event equals last_event ({last})")]
    EmptyInterval { direction: Direction, last: u64 },
    #[error("{direction}: next_event_fast {fast} inconsistent with next_event {next} (fast allowed: {allowed})")]
    FastThreshold {
        direction: Direction,
        fast: u64,
        next: u64,
        allowed: bool,
    },
    #[error("{direction}: current {current} outside [last {last}, next {next})")]
    CurrentOutsideInterval {
        direction: Direction,
        current: u64,
        last: u64,
        next: u64,
    },
    #[error("{direction}: interval {interval} does not match minimum wait {min_wait}")]
    IntervalMismatch {
        direction: Direction,
        interval: u64,
        min_wait: u64,
    },
}
