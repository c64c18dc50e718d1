//! Outcome classification and the job state machine
//!
//! Applies the transition rules to a finished attempt and persists the
//! result: state index first, then the record payload, then the queue
//! push for transient states. Terminal states enqueue nothing.

use crate::error::Result;
use crate::job::{now_ms, JobRecord, JobState};
use crate::router::QueueRouter;
use crate::store::JobStore;
use tracing::{debug, info};

/// Outcome of one dispatch attempt, as reported by the worker loop
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// Whether the consumer reported success
    pub success: bool,

    /// Whether the attempt timer fired before the consumer finished
    pub timed_out: bool,

    /// Error string supplied by the consumer (or synthesized for panics)
    pub error: Option<String>,
}

impl Outcome {
    /// Successful attempt.
    pub fn success() -> Self {
        Self {
            success: true,
            timed_out: false,
            error: None,
        }
    }

    /// Consumer-reported failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            timed_out: false,
            error: Some(message.into()),
        }
    }

    /// Attempt exceeded its process timeout.
    pub fn timeout() -> Self {
        Self {
            success: false,
            timed_out: true,
            error: Some("process timeout exceeded".to_string()),
        }
    }
}

/// Attempt-level state recorded in the process item for this outcome.
///
/// A timed-out attempt is a ghost even when the job itself fails
/// terminally; a single attempt is either ghost or fail, never both.
pub fn run_state(outcome: &Outcome) -> JobState {
    if outcome.success {
        JobState::Success
    } else if outcome.timed_out {
        JobState::Ghost
    } else {
        JobState::Fail
    }
}

/// Compute the job's next state from its record and the attempt outcome.
///
/// Rules are evaluated in order; the first match wins. The record is
/// expected to already carry the finalized process item for this attempt,
/// so `runs` includes the attempt being judged.
///
/// Ghosts are counted with a strict `>` against `ghostTimes`, permitting
/// `ghostTimes + 1` ghost attempts before the terminal fail; retries allow
/// `retryTimes` attempts after the first.
pub fn next_state(record: &JobRecord, outcome: &Outcome) -> JobState {
    if outcome.success {
        return JobState::Success;
    }

    if outcome.timed_out {
        if !record.ghost_retry {
            return JobState::Fail;
        }
        if record.ghost_count() > record.ghost_times {
            return JobState::Fail;
        }
        return JobState::Ghost;
    }

    if !record.retry {
        return JobState::Fail;
    }
    if record.runs.len() as u32 <= record.retry_times {
        return JobState::Retry;
    }
    JobState::Fail
}

/// Applies the state machine to finished jobs and persists the transition
#[derive(Debug, Clone)]
pub struct OutcomeProcessor {
    store: JobStore,
    router: QueueRouter,
}

impl OutcomeProcessor {
    /// Create a processor over the given store and router.
    pub fn new(store: JobStore, router: QueueRouter) -> Self {
        Self { store, router }
    }

    /// Record the attempt outcome on the job and drive its transition:
    /// finalize the process item, compute the next state, then persist in
    /// order (state index, record payload, queue push).
    pub async fn process(&self, record: &mut JobRecord, outcome: &Outcome) -> Result<()> {
        record.finalize_run(run_state(outcome), outcome.error.clone());

        let next = next_state(record, outcome);
        if next.is_terminal() {
            record.finish(next == JobState::Success);
        } else {
            record.update_time = now_ms();
        }

        self.store.update_state_index(record, next).await?;
        self.store.save(record).await?;
        self.router.enqueue(record).await?;

        if next.is_terminal() {
            info!(
                job_id = %record.id,
                job_name = %record.name,
                state = %next,
                attempts = record.runs.len(),
                "job finished"
            );
        } else {
            debug!(
                job_id = %record.id,
                job_name = %record.name,
                state = %next,
                attempts = record.runs.len(),
                "job re-enqueued"
            );
        }

        Ok(())
    }
}
