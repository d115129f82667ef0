//! Runtime configuration.
//!
//! Defaults suit an embedded runtime: a small worker pool and a yield budget large
//! enough that the scheduler overhead stays negligible. Both knobs can be
//! overridden from the environment, and the whole struct deserializes from any
//! serde format so hosts can embed it in their own configuration files.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Environment variable overriding [`RuntimeConfig::worker_threads`].
pub const WORKER_THREADS_ENV: &str = "WEFT_WORKER_THREADS";

/// Environment variable overriding [`RuntimeConfig::yield_after_ops`].
pub const YIELD_AFTER_OPS_ENV: &str = "WEFT_YIELD_AFTER_OPS";

const DEFAULT_YIELD_AFTER_OPS: u32 = 2048;
const DEFAULT_THREAD_NAME: &str = "weft-worker";
const MAX_DEFAULT_WORKERS: usize = 4;

/// Error surfaced when a configuration cannot be used.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An override variable is set but does not parse.
    #[error("{variable} must be a positive integer, got '{value}'")]
    InvalidVariable { variable: &'static str, value: String },
    #[error("the worker pool needs at least one thread")]
    NoWorkers,
    #[error("yield_after_ops must be at least 1")]
    NoYieldBudget,
}

/// Settings for the worker pool and the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker threads fibers are multiplexed onto.
    pub worker_threads: usize,
    /// Evaluator steps a fiber may take before it yields its worker.
    pub yield_after_ops: u32,
    /// Name given to worker threads.
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let available = std::thread::available_parallelism().map(|count| count.get()).unwrap_or(1);
        Self {
            worker_threads: available.min(MAX_DEFAULT_WORKERS),
            yield_after_ops: DEFAULT_YIELD_AFTER_OPS,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Apply [`WORKER_THREADS_ENV`] and [`YIELD_AFTER_OPS_ENV`] on top of `self`.
    /// Unset or blank variables leave the current value in place.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(worker_threads) = read_override(WORKER_THREADS_ENV)? {
            self.worker_threads = worker_threads;
        }
        if let Some(yield_after_ops) = read_override(YIELD_AFTER_OPS_ENV)? {
            self.yield_after_ops = yield_after_ops;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.yield_after_ops == 0 {
            return Err(ConfigError::NoYieldBudget);
        }
        Ok(())
    }
}

fn read_override<T: FromStr>(variable: &'static str) -> Result<Option<T>, ConfigError> {
    let Ok(raw) = env::var(variable) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed = trimmed.parse().map_err(|_| ConfigError::InvalidVariable {
        variable,
        value: raw.clone(),
    })?;
    debug!(variable, value = trimmed, "runtime setting overridden from environment");
    Ok(Some(parsed))
}
