//! Pipeline Configuration
//!
//! Tunables for every stage of the upload pipeline. All sections deserialize
//! with defaults so a partial TOML table is enough.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minimum spacing between two dispatch starts, across all projects
const MIN_DISPATCH_INTERVAL_MS: u64 = 300;

/// Maximum uploads in flight across all projects
const MAX_CONCURRENT_UPLOADS: usize = 3;

/// Delay before re-attempting admission when the gate is full
const CAPACITY_RETRY_DELAY_MS: u64 = 1000;

/// Files moved from the ingest buffer into the pending queue per tick
const INGEST_BATCH_SIZE: usize = 5;

/// Spacing between ingest ticks
const INGEST_INTERVAL_MS: u64 = 500;

/// Retry ceiling for a single file
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// How long a terminal task stays in working memory
const REMOVAL_DELAY_MS: u64 = 5000;

/// Status poll interval while the push channel is down
const POLL_INTERVAL_MS: u64 = 1000;

/// Stall timer for the local upload phase (no server task id yet)
const UPLOAD_TIMEOUT_SECS: u64 = 30;

/// Stall timer for server-side processing
const PROCESSING_TIMEOUT_SECS: u64 = 120;

/// Poll failure backoff
const POLL_BACKOFF_BASE_SECS: u64 = 5;
const POLL_BACKOFF_MAX_SECS: u64 = 30;
const MAX_POLL_FAILURES: u32 = 5;

/// Persisted entries per project
const MAX_STORED_TASKS: usize = 100;

/// Entries kept when the primary store rejects a write
const OVERFLOW_KEEP_TASKS: usize = 50;

/// Count reconciliation
const RECONCILE_THROTTLE_SECS: u64 = 10;
const RECONCILE_MAX_ATTEMPTS: u32 = 3;
const RECONCILE_RETRY_BASE_MS: u64 = 1000;
const RECONCILE_PERIODIC_SECS: u64 = 30;

/// Admission gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum milliseconds between dispatch starts
    pub min_dispatch_interval_ms: u64,
    /// Maximum uploads in flight across all projects
    pub max_concurrent_uploads: usize,
    /// Milliseconds to wait before retrying when at capacity
    pub capacity_retry_delay_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_dispatch_interval_ms: MIN_DISPATCH_INTERVAL_MS,
            max_concurrent_uploads: MAX_CONCURRENT_UPLOADS,
            capacity_retry_delay_ms: CAPACITY_RETRY_DELAY_MS,
        }
    }
}

impl GateConfig {
    pub fn min_dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.min_dispatch_interval_ms)
    }

    pub fn capacity_retry_delay(&self) -> Duration {
        Duration::from_millis(self.capacity_retry_delay_ms)
    }
}

/// Per-project queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Files ingested per tick
    pub ingest_batch_size: usize,
    /// Milliseconds between ingest ticks
    pub ingest_interval_ms: u64,
    /// Retry ceiling per file
    pub max_retry_attempts: u32,
    /// Milliseconds a terminal task stays in working memory
    pub removal_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ingest_batch_size: INGEST_BATCH_SIZE,
            ingest_interval_ms: INGEST_INTERVAL_MS,
            max_retry_attempts: MAX_RETRY_ATTEMPTS,
            removal_delay_ms: REMOVAL_DELAY_MS,
        }
    }
}

impl QueueConfig {
    pub fn ingest_interval(&self) -> Duration {
        Duration::from_millis(self.ingest_interval_ms)
    }

    pub fn removal_delay(&self) -> Duration {
        Duration::from_millis(self.removal_delay_ms)
    }
}

/// Status tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Milliseconds between status polls
    pub poll_interval_ms: u64,
    /// Stall timeout before a server task id is issued
    pub upload_timeout_secs: u64,
    /// Stall timeout for server-side processing
    pub processing_timeout_secs: u64,
    /// First delay after a failed poll
    pub poll_backoff_base_secs: u64,
    /// Upper bound for the poll backoff
    pub poll_backoff_max_secs: u64,
    /// Consecutive poll failures before the task counts as stalled
    pub max_poll_failures: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: POLL_INTERVAL_MS,
            upload_timeout_secs: UPLOAD_TIMEOUT_SECS,
            processing_timeout_secs: PROCESSING_TIMEOUT_SECS,
            poll_backoff_base_secs: POLL_BACKOFF_BASE_SECS,
            poll_backoff_max_secs: POLL_BACKOFF_MAX_SECS,
            max_poll_failures: MAX_POLL_FAILURES,
        }
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn poll_backoff_base(&self) -> Duration {
        Duration::from_secs(self.poll_backoff_base_secs)
    }

    pub fn poll_backoff_max(&self) -> Duration {
        Duration::from_secs(self.poll_backoff_max_secs)
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum entries stored per project
    pub max_stored_tasks: usize,
    /// Entries kept after the primary store rejects a write
    pub overflow_keep_tasks: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_stored_tasks: MAX_STORED_TASKS,
            overflow_keep_tasks: OVERFLOW_KEEP_TASKS,
        }
    }
}

/// Count reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Minimum seconds between two fetches for the same project
    pub throttle_secs: u64,
    /// Fetch attempts before falling back to local counters
    pub max_attempts: u32,
    /// First retry delay; doubles on each attempt
    pub retry_base_ms: u64,
    /// Seconds between periodic refreshes while a batch is running
    pub periodic_interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            throttle_secs: RECONCILE_THROTTLE_SECS,
            max_attempts: RECONCILE_MAX_ATTEMPTS,
            retry_base_ms: RECONCILE_RETRY_BASE_MS,
            periodic_interval_secs: RECONCILE_PERIODIC_SECS,
        }
    }
}

impl ReconcilerConfig {
    pub fn throttle(&self) -> Duration {
        Duration::from_secs(self.throttle_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub gate: GateConfig,
    pub queue: QueueConfig,
    pub tracker: TrackerConfig,
    pub store: StoreConfig,
    pub reconciler: ReconcilerConfig,
}
