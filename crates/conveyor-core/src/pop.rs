//! Blocking pop across per-name queues
//!
//! Wraps `BLPOP` over the `queue:<name>` lists for a set of job names and
//! hands back a fully hydrated record already leased for one attempt.

use crate::connection::RedisPool;
use crate::error::{Error, Result};
use crate::job::{JobRecord, JobState};
use crate::keys::Keys;
use crate::store::JobStore;
use std::time::Duration;
use tracing::{debug, warn};

/// Blocking multi-queue pop
#[derive(Debug, Clone)]
pub struct PopModel {
    pool: RedisPool,
    keys: Keys,
    store: JobStore,
}

impl PopModel {
    /// Create a pop model over the given pool, key namespace and store.
    pub fn new(pool: RedisPool, keys: Keys, store: JobStore) -> Self {
        Self { pool, keys, store }
    }

    /// Block until a job id arrives on any of the given names' queues,
    /// then hydrate and lease it: state moves to `processing` and a fresh
    /// process item is appended with its start time.
    ///
    /// Fails with [`Error::Empty`] when the timeout elapses with no job.
    /// A popped id whose record is missing or corrupt is discarded and
    /// the pop is re-attempted once.
    pub async fn pop(&self, names: &[String], timeout: Duration) -> Result<JobRecord> {
        if names.is_empty() {
            return Err(Error::BadArgument("no job names to pop".to_string()));
        }

        let queue_keys: Vec<String> = names.iter().map(|name| self.keys.queue(name)).collect();

        // Blocking commands park the whole connection, so each pop runs
        // on a dedicated one.
        let mut conn = self.pool.blocking().await?;
        let mut discarded_once = false;

        loop {
            let reply: Option<(String, String)> = redis::cmd("BLPOP")
                .arg(&queue_keys)
                .arg(timeout.as_secs_f64())
                .query_async(&mut conn)
                .await?;

            let Some((_, id)) = reply else {
                return Err(Error::Empty);
            };

            match self.claim(&id).await {
                Ok(record) => {
                    debug!(job_id = %record.id, job_name = %record.name, attempt = record.attempt_count(), "job popped");
                    return Ok(record);
                }
                Err(err @ (Error::NotFound(_) | Error::Corrupt(_))) if !discarded_once => {
                    warn!(job_id = %id, error = %err, "discarding unreadable popped id, re-popping");
                    discarded_once = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Hydrate a popped id and take the lease for one attempt.
    async fn claim(&self, id: &str) -> Result<JobRecord> {
        let mut record = self.store.fetch(id).await?;
        // The index transition must see the pre-pop state before
        // `begin_attempt` overwrites it in memory.
        self.store
            .update_state_index(&mut record, JobState::Processing)
            .await?;
        record.begin_attempt();
        self.store.save(&record).await?;
        Ok(record)
    }
}
