//! Structured lifecycle records.
//!
//! Slow-path decisions (fills, flushes, GC passes, tcache creation and
//! teardown, hook registration) append a record to a bounded in-memory log
//! owned by the runtime. Records below the configured level are dropped at
//! the call site; once the log is full the oldest record is evicted.

use std::collections::VecDeque;

use parking_lot::Mutex;

pub use hotbin_membrane::config::LogLevel;

/// One lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleRecord {
    /// Monotonic decision/event id, assigned on push.
    pub decision_id: u64,
    /// Correlation id, assigned on push.
    pub trace_id: String,
    pub level: LogLevel,
    /// Operation that produced the record (`tcache_fill`, `tcache_gc`, ...).
    pub symbol: &'static str,
    /// Event kind within the operation.
    pub event: &'static str,
    pub tcache_id: Option<u64>,
    pub binind: Option<usize>,
    /// Items moved by the operation, if any.
    pub count: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
}

impl LifecycleRecord {
    #[must_use]
    pub fn new(
        level: LogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
    ) -> Self {
        Self {
            decision_id: 0,
            trace_id: String::new(),
            level,
            symbol,
            event,
            tcache_id: None,
            binind: None,
            count: None,
            outcome,
            details: String::new(),
        }
    }

    #[must_use]
    pub fn with_tcache(mut self, id: u64) -> Self {
        self.tcache_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_bin(mut self, binind: usize) -> Self {
        self.binind = Some(binind);
        self
    }

    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

struct LogInner {
    next_decision_id: u64,
    records: VecDeque<LifecycleRecord>,
    evicted: u64,
}

/// Bounded, lock-protected lifecycle log.
pub struct LifecycleLog {
    threshold: LogLevel,
    capacity: usize,
    inner: Mutex<LogInner>,
}

impl LifecycleLog {
    #[must_use]
    pub fn new(threshold: LogLevel, capacity: usize) -> Self {
        Self {
            threshold,
            capacity,
            inner: Mutex::new(LogInner {
                next_decision_id: 1,
                records: VecDeque::new(),
                evicted: 0,
            }),
        }
    }

    /// Whether a record at `level` would be kept.
    #[inline]
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.capacity > 0 && level >= self.threshold
    }

    /// Append `record`, assigning its decision and trace ids.
    pub fn push(&self, mut record: LifecycleRecord) {
        if !self.enabled(record.level) {
            return;
        }
        let mut inner = self.inner.lock();
        let decision_id = inner.next_decision_id;
        inner.next_decision_id = inner.next_decision_id.wrapping_add(1);
        record.decision_id = decision_id;
        record.trace_id = format!("core::tcache::{}::{:016x}", record.symbol, decision_id);
        if inner.records.len() == self.capacity {
            inner.records.pop_front();
            inner.evicted += 1;
        }
        inner.records.push_back(record);
    }

    /// Build and append a record only when `level` is enabled.
    pub fn push_with(&self, level: LogLevel, build: impl FnOnce() -> LifecycleRecord) {
        if self.enabled(level) {
            self.push(build());
        }
    }

    pub fn drain(&self) -> Vec<LifecycleRecord> {
        self.inner.lock().records.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records dropped because the log was full.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.inner.lock().evicted
    }
}

impl std::fmt::Debug for LifecycleLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleLog")
            .field("threshold", &self.threshold)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
