//! Checker configuration.

use std::thread;

use mcscc_error::{McscError, Result};
use mcscc_store::{MAX_LOG_SIZE, MIN_LOG_SIZE};
use mcscc_types::MAX_WORKERS;
use serde::{Deserialize, Serialize};

/// Default `log2` of the indexing table's home slots.
pub const DEFAULT_LOG_TABLE_SIZE: u32 = 20;

/// Multiplier of the per-worker successor rotation.
pub const PERMUTE_STRIDE: usize = 73;

/// Settings of one checker run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Worker threads, `1..=64`.
    pub workers: usize,
    /// The indexing table holds `2^log_table_size` home slots.
    pub log_table_size: u32,
    /// Stop all workers at the first proved accepting cycle. When `false`
    /// the run completes the SCC decomposition.
    pub stop_on_cycle: bool,
    /// Rotate each worker's successor order by `worker * 73`.
    pub permute_successors: bool,
    /// Emit a progress event every this many first claims (0 disables).
    pub progress_interval: u64,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .clamp(1, MAX_WORKERS);
        Self {
            workers,
            log_table_size: DEFAULT_LOG_TABLE_SIZE,
            stop_on_cycle: true,
            permute_successors: true,
            progress_interval: 0,
        }
    }
}

impl CheckerConfig {
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub const fn with_log_table_size(mut self, log_table_size: u32) -> Self {
        self.log_table_size = log_table_size;
        self
    }

    #[must_use]
    pub const fn with_stop_on_cycle(mut self, stop_on_cycle: bool) -> Self {
        self.stop_on_cycle = stop_on_cycle;
        self
    }

    #[must_use]
    pub const fn with_permute_successors(mut self, permute: bool) -> Self {
        self.permute_successors = permute;
        self
    }

    #[must_use]
    pub const fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Check every field against its valid range.
    ///
    /// # Errors
    ///
    /// Returns [`McscError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_WORKERS).contains(&self.workers) {
            return Err(McscError::invalid_config(format!(
                "workers must be in 1..={MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if !(MIN_LOG_SIZE..=MAX_LOG_SIZE).contains(&self.log_table_size) {
            return Err(McscError::invalid_config(format!(
                "log_table_size must be in {MIN_LOG_SIZE}..={MAX_LOG_SIZE}, got {}",
                self.log_table_size
            )));
        }
        Ok(())
    }

    /// Parse a JSON object; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`McscError::Json`] on malformed input and
    /// [`McscError::InvalidConfig`] if a value is out of range.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}
