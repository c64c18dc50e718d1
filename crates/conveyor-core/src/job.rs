//! Job record types and definitions

use crate::config::JobOptions;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current wall-clock time in milliseconds since the epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Freshly created, runnable immediately
    New,

    /// Waiting for a future `scheduledFor` timestamp
    Delayed,

    /// Promoted out of the scheduled set, runnable
    Queued,

    /// Leased to a worker for one attempt
    Processing,

    /// Failed attempt, will run again (transient)
    Retry,

    /// Timed-out attempt, will run again (transient)
    Ghost,

    /// Completed successfully (terminal)
    Success,

    /// Permanently failed (terminal)
    Fail,
}

impl Default for JobState {
    fn default() -> Self {
        JobState::New
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobState {
    /// Canonical string form, as stored in the Redis `state` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Delayed => "delayed",
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Retry => "retry",
            JobState::Ghost => "ghost",
            JobState::Success => "success",
            JobState::Fail => "fail",
        }
    }

    /// Parse the canonical string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(JobState::New),
            "delayed" => Some(JobState::Delayed),
            "queued" => Some(JobState::Queued),
            "processing" => Some(JobState::Processing),
            "retry" => Some(JobState::Retry),
            "ghost" => Some(JobState::Ghost),
            "success" => Some(JobState::Success),
            "fail" => Some(JobState::Fail),
            _ => None,
        }
    }

    /// Check if the state is terminal (no further transitions, no re-enqueue).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Fail)
    }
}

/// Record of one dispatch attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessItem {
    /// 1-based attempt number
    pub count: u32,

    /// Attempt start timestamp (ms)
    pub start_time: i64,

    /// Duration of the attempt (ms), set when the attempt finishes
    #[serde(default)]
    pub process_time: Option<i64>,

    /// Outcome state of this attempt
    pub state: JobState,

    /// Error string on non-success
    #[serde(default)]
    pub error_message: Option<String>,
}

/// A single job with its policy and full history of process attempts.
///
/// The canonical serialization of this struct is what lands in the
/// `itemData` field of the per-job Redis hash. The hash's separate `state`
/// field is authoritative when the two disagree (see `JobStore::fetch`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Opaque id, counter-allocated; never mutated after allocation
    #[serde(default)]
    pub id: String,

    /// Job-kind identifier; partitions queues
    pub name: String,

    /// Arbitrary payload passed to the consumer
    #[serde(default)]
    pub data: Option<serde_json::Value>,

    /// Current lifecycle state (advisory inside `itemData`)
    #[serde(default)]
    pub state: JobState,

    /// Creation timestamp (ms)
    pub create_time: i64,

    /// Last-modified timestamp (ms)
    pub update_time: i64,

    /// Set when the state enters a terminal value (ms)
    #[serde(default)]
    pub finish_time: Option<i64>,

    /// Whether user errors trigger retry
    #[serde(default)]
    pub retry: bool,

    /// Maximum attempts after the first
    #[serde(default)]
    pub retry_times: u32,

    /// Delay before a retried job becomes runnable (ms)
    #[serde(default)]
    pub retry_interval: u64,

    /// Whether timeouts are retried
    #[serde(default)]
    pub ghost_retry: bool,

    /// Maximum permitted ghost occurrences
    #[serde(default)]
    pub ghost_times: u32,

    /// Delay before a ghosted job becomes runnable (ms)
    #[serde(default)]
    pub ghost_interval: u64,

    /// Wall-clock limit for one attempt (ms)
    pub process_timeout: u64,

    /// Absolute due timestamp (ms) for delayed jobs
    #[serde(default)]
    pub scheduled_for: Option<i64>,

    /// One entry per dispatch attempt, in order
    #[serde(default)]
    pub runs: Vec<ProcessItem>,

    /// Set on terminal transition
    #[serde(default)]
    pub complete: bool,

    /// Set on terminal transition
    #[serde(default)]
    pub success: bool,

    /// Sum of per-run durations (ms), set on terminal transition
    #[serde(default)]
    pub total_process_time: Option<i64>,
}

impl JobRecord {
    /// Create a new record from creation inputs. The id stays empty until
    /// the store allocates one.
    pub fn new(
        name: impl Into<String>,
        data: Option<serde_json::Value>,
        options: &JobOptions,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::BadArgument("missing job name".to_string()));
        }

        let now = now_ms();
        let state = match options.scheduled_for {
            Some(due) if due > now => JobState::Delayed,
            _ => JobState::New,
        };

        Ok(Self {
            id: String::new(),
            name,
            data,
            state,
            create_time: now,
            update_time: now,
            finish_time: None,
            retry: options.retry,
            retry_times: options.retry_times,
            retry_interval: options.retry_interval_ms,
            ghost_retry: options.ghost_retry,
            ghost_times: options.ghost_times,
            ghost_interval: options.ghost_interval_ms,
            process_timeout: options.process_timeout_ms,
            scheduled_for: options.scheduled_for,
            runs: Vec::new(),
            complete: false,
            success: false,
            total_process_time: None,
        })
    }

    /// Number of attempts seen so far.
    pub fn attempt_count(&self) -> u32 {
        self.runs.len() as u32
    }

    /// Number of attempts that ended as ghosts.
    pub fn ghost_count(&self) -> u32 {
        self.runs
            .iter()
            .filter(|run| run.state == JobState::Ghost)
            .count() as u32
    }

    /// Begin a new attempt: append a fresh process item and move the
    /// in-memory state to `Processing`.
    pub fn begin_attempt(&mut self) {
        let now = now_ms();
        self.runs.push(ProcessItem {
            count: self.runs.len() as u32 + 1,
            start_time: now,
            process_time: None,
            state: JobState::Processing,
            error_message: None,
        });
        self.state = JobState::Processing;
        self.update_time = now;
    }

    /// Close the current attempt with its outcome state, duration and
    /// error message.
    pub fn finalize_run(&mut self, state: JobState, error_message: Option<String>) {
        let now = now_ms();
        if let Some(run) = self.runs.last_mut() {
            run.state = state;
            run.process_time = Some((now - run.start_time).max(0));
            run.error_message = error_message;
        }
        self.update_time = now;
    }

    /// Mark the record terminal. The caller is responsible for writing the
    /// terminal state itself through the state index.
    pub fn finish(&mut self, success: bool) {
        let now = now_ms();
        self.complete = true;
        self.success = success;
        self.finish_time = Some(now);
        self.update_time = now;
        self.total_process_time = Some(self.runs.iter().filter_map(|run| run.process_time).sum());
    }

    /// Serialize to the canonical `itemData` payload.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize the canonical `itemData` payload. Unknown fields are
    /// tolerated for forward compatibility.
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| Error::Corrupt(e.to_string()))
    }

    /// Read-only view handed to consumer callbacks.
    pub fn public_view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state,
            attempt: self.runs.len() as u32,
            create_time: self.create_time,
            scheduled_for: self.scheduled_for,
            retry: self.retry,
            retry_times: self.retry_times,
            ghost_retry: self.ghost_retry,
            ghost_times: self.ghost_times,
            process_timeout: self.process_timeout,
        }
    }
}

/// Read-only view of a job, exposed to consumer callbacks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    /// Job id
    pub id: String,

    /// Job-kind identifier
    pub name: String,

    /// State at dispatch time
    pub state: JobState,

    /// 1-based number of the attempt being dispatched
    pub attempt: u32,

    /// Creation timestamp (ms)
    pub create_time: i64,

    /// Absolute due timestamp (ms) for delayed jobs
    pub scheduled_for: Option<i64>,

    /// Whether user errors trigger retry
    pub retry: bool,

    /// Maximum attempts after the first
    pub retry_times: u32,

    /// Whether timeouts are retried
    pub ghost_retry: bool,

    /// Maximum permitted ghost occurrences
    pub ghost_times: u32,

    /// Wall-clock limit for one attempt (ms)
    pub process_timeout: u64,
}
