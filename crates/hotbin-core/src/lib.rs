//! # hotbin-core
//!
//! A per-thread object cache in front of a shared arena, and the byte-paced
//! event scheduler that drives its garbage collection along with the other
//! per-thread periodic work (profiling samples, stats snapshots, peak
//! tracking and user hooks).
//!
//! A thread reaches both through its [`Tsd`]: allocation and deallocation
//! take a fast path while the thread's byte counter stays below its fast
//! threshold, and fall into the slow path, where the scheduler runs, once it
//! crosses it. Process-wide state lives in a [`Runtime`].

#![deny(unsafe_code)]

pub mod error;
pub mod event;
pub mod log;
pub mod malloc;
pub mod runtime;
pub mod size_class;
pub mod tsd;

pub use error::{InvariantViolation, RegisterError, TcacheError, TcachesError};
pub use event::{Direction, ProfilingHooks, RegisterOutcome, UserEventCallback, UserHook};
pub use log::{LifecycleLog, LifecycleRecord, LogLevel};
pub use malloc::{Arena, SimArena, ThreadCache};
pub use runtime::{Runtime, RuntimeBuilder};
pub use tsd::{EventContext, Tsd, TsdShared, TsdState, with_thread_tsd};
