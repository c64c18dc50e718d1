//! Scheduler for delayed, retry-delayed and ghost-delayed jobs
//!
//! A single process-wide periodic task. Each tick promotes every id in the
//! scheduled sorted set whose due time has arrived into its active queue,
//! and resurrects jobs orphaned in `processing` (a worker died or lost its
//! outcome write) through the ghost mechanism.

use crate::config::SchedulerConfig;
use crate::connection::RedisPool;
use crate::error::Result;
use crate::job::{now_ms, JobState};
use crate::keys::Keys;
use crate::outcome::{Outcome, OutcomeProcessor};
use crate::queue::JobQueue;
use crate::router::QueueRouter;
use crate::store::JobStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodic mover of due jobs into their active queues
pub struct Scheduler {
    pool: RedisPool,
    keys: Keys,
    store: JobStore,
    router: QueueRouter,
    outcomes: OutcomeProcessor,
    config: SchedulerConfig,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    /// Create a scheduler over the given queue.
    pub fn new(queue: &JobQueue, config: SchedulerConfig) -> Self {
        Self {
            pool: queue.pool().clone(),
            keys: queue.keys().clone(),
            store: queue.store().clone(),
            router: queue.router().clone(),
            outcomes: OutcomeProcessor::new(queue.store().clone(), queue.router().clone()),
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the tick loop.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(interval_ms = self.config.tick_interval_ms, "scheduler running");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.tick_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first interval tick fires immediately
            ticker.tick().await;

            while self.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }

                match self.tick().await {
                    Ok(moved) if moved > 0 => debug!(moved, "scheduler tick promoted jobs"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "scheduler tick failed"),
                }

                if let Err(err) = self.recover_ghosts().await {
                    warn!(error = %err, "ghost recovery sweep failed");
                }
            }

            info!("scheduler stopped");
        })
    }

    /// Stop the tick loop after the current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run one promotion pass: move every due id from the scheduled set
    /// into its active queue. Failures on individual ids are logged and do
    /// not abort the tick.
    pub async fn tick(&self) -> Result<usize> {
        let mut conn = self.pool.shared().await?;
        let now = now_ms();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.scheduled())
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(self.config.batch_size)
            .query_async(&mut conn)
            .await?;

        let mut moved = 0;
        for id in due {
            // ZREM is the claim: losing the race means another scheduler
            // instance already took this id.
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.keys.scheduled())
                .arg(&id)
                .query_async(&mut conn)
                .await?;
            if removed == 0 {
                continue;
            }

            match self.promote(&id).await {
                Ok(()) => moved += 1,
                Err(err) => warn!(job_id = %id, error = %err, "failed to promote scheduled job"),
            }
        }

        Ok(moved)
    }

    /// Move one claimed id into its active queue.
    async fn promote(&self, id: &str) -> Result<()> {
        let mut record = self.store.fetch(id).await?;

        record.scheduled_for = None;
        self.store
            .update_state_index(&mut record, JobState::Queued)
            .await?;
        record.update_time = now_ms();
        self.store.save(&record).await?;
        self.router.enqueue(&record).await?;

        debug!(job_id = %record.id, job_name = %record.name, "scheduled job promoted");
        Ok(())
    }

    /// Resurrect jobs stuck in `processing` past their attempt timeout
    /// plus grace: their worker either died or failed to persist the
    /// outcome, so the attempt is judged a timeout and the state machine
    /// decides between ghost re-enqueue and terminal fail.
    pub async fn recover_ghosts(&self) -> Result<usize> {
        let ids = self.store.state_members(JobState::Processing).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let now = now_ms();
        let grace = self.config.ghost_grace_ms as i64;
        let mut recovered = 0;

        for id in ids {
            let mut record = match self.store.fetch(&id).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(job_id = %id, error = %err, "failed to fetch processing job for ghost recovery");
                    continue;
                }
            };

            let Some(run) = record.runs.last() else {
                continue;
            };
            let deadline = run.start_time + record.process_timeout as i64 + grace;
            if run.state != JobState::Processing || now < deadline {
                continue;
            }

            warn!(job_id = %record.id, job_name = %record.name, "resurrecting orphaned processing job");
            match self.outcomes.process(&mut record, &Outcome::timeout()).await {
                Ok(()) => recovered += 1,
                Err(err) => warn!(job_id = %id, error = %err, "ghost recovery failed for job"),
            }
        }

        Ok(recovered)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("namespace", &self.keys.namespace())
            .field("tick_interval_ms", &self.config.tick_interval_ms)
            .finish()
    }
}
