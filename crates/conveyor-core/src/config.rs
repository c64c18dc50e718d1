//! Queue, worker, scheduler and per-job configuration
//!
//! Loading these structs from files or the environment is left to the
//! embedding application; everything here is plain serde data with
//! sensible defaults.

use crate::job::now_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Namespace prefix for every Redis key, configured once per process
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Redis connection configuration
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            redis: RedisConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Configuration under a caller-chosen namespace
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }
}

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis server URL (redis://host:port/db)
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Max connection attempts before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between connection attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connect_timeout_ms: 5000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl RedisConfig {
    /// Development configuration (local Redis, fail fast)
    pub fn development() -> Self {
        Self {
            connect_timeout_ms: 2000,
            max_retries: 1,
            retry_delay_ms: 100,
            ..Self::default()
        }
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Worker loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Target number of in-flight jobs
    #[serde(default = "default_concurrent_jobs")]
    pub concurrent_jobs: usize,

    /// Blocking pop timeout
    #[serde(default = "default_pop_timeout")]
    pub pop_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrent_jobs: 1,
            pop_timeout_ms: 5000,
        }
    }
}

impl WorkerConfig {
    /// Get the blocking pop timeout as Duration
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tick interval for moving due jobs into their active queues
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Max ids promoted per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Extra slack past `processTimeout` before a job stuck in
    /// `processing` is treated as orphaned and ghosted
    #[serde(default = "default_ghost_grace")]
    pub ghost_grace_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            batch_size: 100,
            ghost_grace_ms: 5000,
        }
    }
}

impl SchedulerConfig {
    /// Get tick interval as Duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Get ghost grace as Duration
    pub fn ghost_grace(&self) -> Duration {
        Duration::from_millis(self.ghost_grace_ms)
    }
}

/// Per-job retry, ghost and timeout policy supplied at creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Whether user errors trigger retry
    #[serde(default)]
    pub retry: bool,

    /// Maximum attempts after the first
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,

    /// Delay before a retried job becomes runnable
    #[serde(default)]
    pub retry_interval_ms: u64,

    /// Whether timeouts are retried
    #[serde(default)]
    pub ghost_retry: bool,

    /// Maximum permitted ghost occurrences
    #[serde(default = "default_ghost_times")]
    pub ghost_times: u32,

    /// Delay before a ghosted job becomes runnable
    #[serde(default)]
    pub ghost_interval_ms: u64,

    /// Wall-clock limit for one attempt
    #[serde(default = "default_process_timeout")]
    pub process_timeout_ms: u64,

    /// Absolute timestamp (ms); if present and future, the job begins
    /// in the delayed state
    #[serde(default)]
    pub scheduled_for: Option<i64>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            retry: false,
            retry_times: 3,
            retry_interval_ms: 0,
            ghost_retry: false,
            ghost_times: 1,
            ghost_interval_ms: 0,
            process_timeout_ms: 10_000,
            scheduled_for: None,
        }
    }
}

impl JobOptions {
    /// Enable retry with the given max attempts after the first
    pub fn with_retry(mut self, retry_times: u32) -> Self {
        self.retry = true;
        self.retry_times = retry_times;
        self
    }

    /// Set the delay before a retried job becomes runnable
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Enable ghost retry with the given max ghost occurrences
    pub fn with_ghost_retry(mut self, ghost_times: u32) -> Self {
        self.ghost_retry = true;
        self.ghost_times = ghost_times;
        self
    }

    /// Set the delay before a ghosted job becomes runnable
    pub fn with_ghost_interval(mut self, interval: Duration) -> Self {
        self.ghost_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the wall-clock limit for one attempt
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Schedule the job to become runnable at an absolute timestamp (ms)
    pub fn schedule_at(mut self, timestamp_ms: i64) -> Self {
        self.scheduled_for = Some(timestamp_ms);
        self
    }

    /// Schedule the job to become runnable after a relative delay
    pub fn delay(mut self, delay: Duration) -> Self {
        self.scheduled_for = Some(now_ms() + delay.as_millis() as i64);
        self
    }

    /// Get the attempt timeout as Duration
    pub fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.process_timeout_ms)
    }
}

// Default value helper functions
fn default_namespace() -> String {
    "conveyor".to_string()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_connect_timeout() -> u64 {
    5000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    1000
}
fn default_concurrent_jobs() -> usize {
    1
}
fn default_pop_timeout() -> u64 {
    5000
}
fn default_tick_interval() -> u64 {
    1000
}
fn default_batch_size() -> usize {
    100
}
fn default_ghost_grace() -> u64 {
    5000
}
fn default_retry_times() -> u32 {
    3
}
fn default_ghost_times() -> u32 {
    1
}
fn default_process_timeout() -> u64 {
    10_000
}
