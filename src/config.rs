//! Shard runtime configuration: loading and defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// One task-id range spans `1 << range_size_bits` ids.
    pub range_size_bits: u32,

    /// Minimum interval between shard-row persists driven by ack-level
    /// updates. Updates inside the window stay in memory.
    pub shard_update_min_interval_ms: u64,

    /// How far ahead of "now" the scheduled-task read level may move.
    pub timer_max_time_shift_ms: u64,

    /// I/O deadline for shard-row loads and renewals, regardless of the
    /// caller's deadline.
    pub shard_io_timeout_ms: u64,

    /// Floor applied to caller deadlines on workflow mutations.
    pub min_mutation_timeout_ms: u64,

    pub acquire_initial_backoff_ms: u64,
    pub acquire_max_backoff_ms: u64,
    pub acquire_expiration_ms: u64,

    pub persistence_initial_backoff_ms: u64,
    pub persistence_max_backoff_ms: u64,
    pub persistence_expiration_ms: u64,

    /// Warn when a single append pushes a history past this size.
    pub history_size_warn_bytes: u64,

    /// Emit the ack-level diff warning when levels drift too far apart.
    pub emit_shard_lag_log: bool,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            range_size_bits: 20,
            shard_update_min_interval_ms: 5 * 60 * 1_000,
            timer_max_time_shift_ms: 1_000,
            shard_io_timeout_ms: 5_000,
            min_mutation_timeout_ms: 2_000,
            acquire_initial_backoff_ms: 50,
            acquire_max_backoff_ms: 10_000,
            acquire_expiration_ms: 5 * 60 * 1_000,
            persistence_initial_backoff_ms: 50,
            persistence_max_backoff_ms: 10_000,
            persistence_expiration_ms: 30_000,
            history_size_warn_bytes: 10 * 1024 * 1024,
            emit_shard_lag_log: true,
        }
    }
}

impl ShardConfig {
    pub fn shard_update_min_interval(&self) -> Duration {
        Duration::from_millis(self.shard_update_min_interval_ms)
    }

    pub fn timer_max_time_shift(&self) -> Duration {
        Duration::from_millis(self.timer_max_time_shift_ms)
    }

    pub fn shard_io_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_io_timeout_ms)
    }

    pub fn min_mutation_timeout(&self) -> Duration {
        Duration::from_millis(self.min_mutation_timeout_ms)
    }

    /// Policy for the background shard-acquisition loop.
    pub fn acquire_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(Duration::from_millis(self.acquire_initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.acquire_max_backoff_ms))
            .with_expiration(Duration::from_millis(self.acquire_expiration_ms))
    }

    /// Policy wrapping the deletion sub-steps and other driver-level
    /// retries.
    pub fn persistence_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(Duration::from_millis(self.persistence_initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.persistence_max_backoff_ms))
            .with_expiration(Duration::from_millis(self.persistence_expiration_ms))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub fn load(path: &Path) -> Result<ShardConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load `path`, falling back to defaults when the file is absent or
/// unreadable.
pub fn load_or_default(path: &Path) -> ShardConfig {
    if !path.exists() {
        return ShardConfig::default();
    }
    match load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("shard config load failed, using defaults: {e}");
            ShardConfig::default()
        }
    }
}
