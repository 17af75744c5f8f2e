//! Harness errors.

use hotbin_core::RegisterError;
use hotbin_membrane::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("hook registration: {0}")]
    Register(#[from] RegisterError),
    #[error("workload thread {0} panicked")]
    WorkerPanicked(usize),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("{invalid} of {lines} log lines failed validation")]
    InvalidLog { lines: usize, invalid: usize },
}
