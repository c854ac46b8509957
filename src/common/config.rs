//! Configuration for regionmaster components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Procedure executor settings
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Remote dispatcher settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Region state machine settings
    #[serde(default)]
    pub assignment: AssignmentConfig,

    /// Durable store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            assignment: AssignmentConfig::default(),
            store: StoreConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then `REGIONMASTER__*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("REGIONMASTER")
                .prefix_separator("__")
                .separator("__"),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.worker_threads == 0 {
            return Err(Error::InvalidConfig(
                "executor.worker_threads must be > 0".into(),
            ));
        }
        if self.executor.result_retention_ms == 0 {
            return Err(Error::InvalidConfig(
                "executor.result_retention_ms must be > 0".into(),
            ));
        }
        if self.assignment.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "assignment.max_attempts must be > 0".into(),
            ));
        }
        if self.dispatcher.queue_full_max_delay_ms < self.dispatcher.queue_full_base_delay_ms {
            return Err(Error::InvalidConfig(
                "dispatcher.queue_full_max_delay_ms must be >= queue_full_base_delay_ms".into(),
            ));
        }
        if self.dispatcher.timeout_max_delay_ms < self.dispatcher.timeout_retry_delay_ms {
            return Err(Error::InvalidConfig(
                "dispatcher.timeout_max_delay_ms must be >= timeout_retry_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Procedure executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Size of the worker pool stepping procedures
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// How long a finished procedure's outcome stays available to waiters
    #[serde(default = "default_result_retention")]
    pub result_retention_ms: u64,
}

fn default_worker_threads() -> usize {
    16
}
fn default_result_retention() -> u64 {
    300_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            result_retention_ms: default_result_retention(),
        }
    }
}

impl ExecutorConfig {
    pub fn result_retention(&self) -> Duration {
        Duration::from_millis(self.result_retention_ms)
    }
}

/// Remote dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Delay before draining a node queue, lets concurrent operations join the batch
    #[serde(default = "default_batch_delay")]
    pub batch_delay_ms: u64,

    /// Upper bound on operations per RPC
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Node-directed RPC timeout
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Consecutive timeouts tolerated before the node is suspected dead
    #[serde(default = "default_max_timeout_retries")]
    pub max_timeout_retries: u32,

    /// First retry delay after a timeout (doubles per attempt)
    #[serde(default = "default_timeout_retry_delay")]
    pub timeout_retry_delay_ms: u64,

    /// Cap on the timeout retry delay
    #[serde(default = "default_timeout_max_delay")]
    pub timeout_max_delay_ms: u64,

    /// Fixed retry delay while a node is still starting up
    #[serde(default = "default_startup_retry_delay")]
    pub startup_retry_delay_ms: u64,

    /// First retry delay when a node reports its call queue is full
    #[serde(default = "default_queue_full_base_delay")]
    pub queue_full_base_delay_ms: u64,

    /// Cap on the queue-full retry delay
    #[serde(default = "default_queue_full_max_delay")]
    pub queue_full_max_delay_ms: u64,
}

fn default_batch_delay() -> u64 {
    5
}
fn default_max_batch_size() -> usize {
    256
}
fn default_rpc_timeout() -> u64 {
    30_000
}
fn default_max_timeout_retries() -> u32 {
    5
}
fn default_timeout_retry_delay() -> u64 {
    100
}
fn default_timeout_max_delay() -> u64 {
    5_000
}
fn default_startup_retry_delay() -> u64 {
    100
}
fn default_queue_full_base_delay() -> u64 {
    50
}
fn default_queue_full_max_delay() -> u64 {
    10_000
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_delay_ms: default_batch_delay(),
            max_batch_size: default_max_batch_size(),
            rpc_timeout_ms: default_rpc_timeout(),
            max_timeout_retries: default_max_timeout_retries(),
            timeout_retry_delay_ms: default_timeout_retry_delay(),
            timeout_max_delay_ms: default_timeout_max_delay(),
            startup_retry_delay_ms: default_startup_retry_delay(),
            queue_full_base_delay_ms: default_queue_full_base_delay(),
            queue_full_max_delay_ms: default_queue_full_max_delay(),
        }
    }
}

impl DispatcherConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Exponential delay for the n-th consecutive timeout (1-based)
    pub fn timeout_delay(&self, attempt: u32) -> Duration {
        backoff(
            self.timeout_retry_delay_ms,
            self.timeout_max_delay_ms,
            attempt,
        )
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_retry_delay_ms)
    }

    /// Growing delay for the n-th consecutive queue-full rejection (1-based)
    pub fn queue_full_delay(&self, attempt: u32) -> Duration {
        backoff(
            self.queue_full_base_delay_ms,
            self.queue_full_max_delay_ms,
            attempt,
        )
    }
}

/// Region state machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentConfig {
    /// FAILED_OPEN reports tolerated before an assign fails terminally
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Close attempts answered with "not closed" before an unassign gives up
    #[serde(default = "default_max_close_attempts")]
    pub max_close_attempts: u32,

    /// Base delay between assignment retries
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Cap on the delay between assignment retries
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}
fn default_max_close_attempts() -> u32 {
    10
}
fn default_retry_delay() -> u64 {
    50
}
fn default_retry_max_delay() -> u64 {
    5_000
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_close_attempts: default_max_close_attempts(),
            retry_delay_ms: default_retry_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

impl AssignmentConfig {
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        backoff(self.retry_delay_ms, self.retry_max_delay_ms, attempt)
    }
}

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncPolicy {
    /// fsync after every append
    Always,
    /// Flush to the OS after every append
    Interval,
    /// Leave buffering to the writer
    Never,
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the procedure log and region-state table
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_sync_policy")]
    pub sync_policy: WalSyncPolicy,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./regionmaster-data")
}
fn default_sync_policy() -> WalSyncPolicy {
    WalSyncPolicy::Always
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            sync_policy: default_sync_policy(),
        }
    }
}

impl StoreConfig {
    pub fn procedure_log(&self) -> PathBuf {
        self.dir.join("procedures.wal")
    }

    pub fn region_log(&self) -> PathBuf {
        self.dir.join("regions.wal")
    }
}

fn backoff(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let delay = base_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(delay.min(max_ms))
}
