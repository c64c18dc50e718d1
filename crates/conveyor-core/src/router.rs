//! Queue routing
//!
//! Pushes a job id onto the Redis structure its current state calls for:
//! the per-name FIFO list for runnable jobs, the scheduled sorted set for
//! delayed ones, nothing for terminal ones.

use crate::connection::RedisPool;
use crate::error::Result;
use crate::job::{now_ms, JobRecord, JobState};
use crate::keys::Keys;
use tracing::{debug, trace};

/// Routes job ids to their destination queue by record state
#[derive(Debug, Clone)]
pub struct QueueRouter {
    pool: RedisPool,
    keys: Keys,
}

impl QueueRouter {
    /// Create a router over the given pool and key namespace.
    pub fn new(pool: RedisPool, keys: Keys) -> Self {
        Self { pool, keys }
    }

    /// Enqueue a record according to its current state.
    ///
    /// Runnable states land at the tail of `queue:<name>` (push order
    /// within a queue is strictly FIFO); retry/ghost states with a
    /// positive interval and delayed jobs land in the scheduled sorted
    /// set at their due timestamp; terminal states enqueue nothing.
    pub async fn enqueue(&self, record: &JobRecord) -> Result<()> {
        match record.state {
            JobState::New | JobState::Queued => self.push(record).await,
            JobState::Retry => {
                if record.retry_interval > 0 {
                    self.schedule(record, now_ms() + record.retry_interval as i64)
                        .await
                } else {
                    self.push(record).await
                }
            }
            JobState::Ghost => {
                if record.ghost_interval > 0 {
                    self.schedule(record, now_ms() + record.ghost_interval as i64)
                        .await
                } else {
                    self.push(record).await
                }
            }
            JobState::Delayed => match record.scheduled_for {
                Some(due) if due > now_ms() => self.schedule(record, due).await,
                _ => self.push(record).await,
            },
            JobState::Success | JobState::Fail => {
                // archival only
                trace!(job_id = %record.id, state = %record.state, "terminal state, nothing to enqueue");
                Ok(())
            }
            JobState::Processing => {
                // a leased job is owned by its worker, never re-routed here
                trace!(job_id = %record.id, "processing job is not routable");
                Ok(())
            }
        }
    }

    async fn push(&self, record: &JobRecord) -> Result<()> {
        let mut conn = self.pool.shared().await?;

        let _: () = redis::cmd("RPUSH")
            .arg(self.keys.queue(&record.name))
            .arg(&record.id)
            .query_async(&mut conn)
            .await?;

        debug!(job_id = %record.id, job_name = %record.name, "job pushed to queue");
        Ok(())
    }

    async fn schedule(&self, record: &JobRecord, due: i64) -> Result<()> {
        let mut conn = self.pool.shared().await?;

        let _: () = redis::cmd("ZADD")
            .arg(self.keys.scheduled())
            .arg(due)
            .arg(&record.id)
            .query_async(&mut conn)
            .await?;

        debug!(job_id = %record.id, due, "job added to scheduled set");
        Ok(())
    }
}
