//! Configuration for the redo pipeline
//!
//! Controls log buffer sizing, the closed-log backpressure wait, reservation
//! retries and the writer's deferred fsync behavior. The default
//! configuration favors high-concurrency throughput; `low_concurrency()`
//! skips the closed-log wait entirely, which is where single-threaded
//! commits spend most of their fixed cost.
//!
//! # Presets
//!
//! - [`RedoConfig::default()`] - Balanced (10ms fsync interval, bounded closed log)
//! - [`RedoConfig::synchronous()`] - fsync after every written batch
//! - [`RedoConfig::high_throughput()`] - Bigger buffer, longer fsync interval
//! - [`RedoConfig::low_concurrency()`] - No closed-log wait

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RedoError, Result};
use crate::types::Lsn;

/// Smallest log buffer we accept (must hold at least a few MTRs)
pub const MIN_LOG_BUFFER_SIZE: u64 = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedoConfig {
    /// Capacity of the in-memory log buffer (bytes)
    pub log_buffer_size: u64,
    /// Commits wait while closed-but-not-durable bytes are at or above this.
    /// `None` disables the wait.
    pub recent_closed_threshold: Option<u64>,
    /// Upper bound for the closed-log wait before warning and proceeding (milliseconds)
    pub max_closed_wait_ms: u64,
    /// How many times a reservation is retried before the commit fails
    pub reserve_retry_limit: u32,
    /// How often the writer wakes up without being nudged (milliseconds)
    pub writer_tick_ms: u64,
    /// How often to fsync the redo file (milliseconds). Set to 0 for sync per batch.
    pub fsync_interval_ms: u64,
    /// Maximum bytes written but not fsynced before forcing an fsync
    pub max_unfsynced_bytes: u64,
    /// Largest single block the writer drains from the buffer (bytes)
    pub max_write_batch: u64,
    /// How long a commit may wait for earlier commits to reach the flush list (milliseconds)
    pub flush_order_timeout_ms: u64,
    /// How long `flush_up_to` waits for durability (milliseconds)
    pub durable_wait_timeout_ms: u64,
    /// LSN handed out to the first reservation of a fresh log
    pub start_lsn: Lsn,
}

impl Default for RedoConfig {
    fn default() -> Self {
        Self {
            log_buffer_size: 1 << 20,               // 1 MB
            recent_closed_threshold: Some(1 << 19), // half the buffer
            max_closed_wait_ms: 1000,
            reserve_retry_limit: 1000,
            writer_tick_ms: 1,
            fsync_interval_ms: 10,
            max_unfsynced_bytes: 1 << 20,
            max_write_batch: 64 * 1024,
            flush_order_timeout_ms: 30_000,
            durable_wait_timeout_ms: 30_000,
            start_lsn: 0,
        }
    }
}

impl RedoConfig {
    /// fsync after every batch the writer writes
    pub fn synchronous() -> Self {
        Self {
            fsync_interval_ms: 0,
            ..Default::default()
        }
    }

    /// Larger buffer and fsync interval (higher latency)
    pub fn high_throughput() -> Self {
        Self {
            log_buffer_size: 16 << 20, // 16 MB
            recent_closed_threshold: Some(8 << 20),
            fsync_interval_ms: 50,
            max_unfsynced_bytes: 8 << 20,
            max_write_batch: 1 << 20,
            ..Default::default()
        }
    }

    /// Skip the closed-log wait; commits never sleep on the writer
    pub fn low_concurrency() -> Self {
        Self {
            recent_closed_threshold: None,
            ..Default::default()
        }
    }

    /// Look up a preset by name (case-insensitive)
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "default" => Some(Self::default()),
            "synchronous" | "sync" => Some(Self::synchronous()),
            "high-throughput" | "high_throughput" => Some(Self::high_throughput()),
            "low-concurrency" | "low_concurrency" => Some(Self::low_concurrency()),
            _ => None,
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: RedoConfig = serde_json::from_str(&text)
            .map_err(|e| RedoError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values can work together
    pub fn validate(&self) -> Result<()> {
        if self.log_buffer_size < MIN_LOG_BUFFER_SIZE {
            return Err(RedoError::Config(format!(
                "log_buffer_size must be at least {} bytes (got {})",
                MIN_LOG_BUFFER_SIZE, self.log_buffer_size
            )));
        }
        if self.max_write_batch == 0 {
            return Err(RedoError::Config("max_write_batch must be positive".to_string()));
        }
        if self.writer_tick_ms == 0 {
            return Err(RedoError::Config("writer_tick_ms must be positive".to_string()));
        }
        if let Some(threshold) = self.recent_closed_threshold {
            if threshold > self.log_buffer_size {
                return Err(RedoError::Config(format!(
                    "recent_closed_threshold ({}) exceeds log_buffer_size ({})",
                    threshold, self.log_buffer_size
                )));
            }
        }
        Ok(())
    }

    pub fn max_closed_wait(&self) -> Duration {
        Duration::from_millis(self.max_closed_wait_ms)
    }

    pub fn writer_tick(&self) -> Duration {
        Duration::from_millis(self.writer_tick_ms)
    }

    pub fn fsync_interval(&self) -> Duration {
        Duration::from_millis(self.fsync_interval_ms)
    }

    pub fn flush_order_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_order_timeout_ms)
    }

    pub fn durable_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.durable_wait_timeout_ms)
    }
}
