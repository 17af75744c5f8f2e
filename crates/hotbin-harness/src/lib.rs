//! Workload and invariant harness for hotbin.
//!
//! This crate provides:
//! - Seeded multi-thread workloads over a fresh runtime, with per-operation
//!   event counter checks and an end-of-run leak check
//! - Structured JSONL logs converted from core lifecycle records, plus an
//!   artifact index with SHA-256 digests
//! - A per-bin capacity table for any conf string

#![forbid(unsafe_code)]

pub mod bin_table;
pub mod error;
pub mod structured_log;
pub mod workload;

pub use bin_table::{BinRow, bin_table, render_bin_table};
pub use error::HarnessError;
pub use structured_log::{ArtifactIndex, LogEmitter, LogEntry, validate_log_file};
pub use workload::{WorkloadConfig, WorkloadReport, run_workload};
