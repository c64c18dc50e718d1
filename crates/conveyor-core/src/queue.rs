//! Queue facade
//!
//! Ties the pool, key namer, store and router together behind the producer
//! surface: create a job, fetch it back, peek at state counts. Workers and
//! the scheduler borrow the same pieces.

use crate::config::{JobOptions, QueueConfig};
use crate::connection::RedisPool;
use crate::error::Result;
use crate::job::{JobRecord, JobState};
use crate::keys::Keys;
use crate::router::QueueRouter;
use crate::store::JobStore;
use tracing::info;

/// Redis-backed job queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: RedisPool,
    keys: Keys,
    store: JobStore,
    router: QueueRouter,
}

impl JobQueue {
    /// Connect to Redis and build a queue from configuration.
    pub async fn connect(config: QueueConfig) -> Result<Self> {
        let pool = RedisPool::new(config.redis.clone()).await?;
        Ok(Self::new(pool, &config))
    }

    /// Build a queue over an existing pool.
    pub fn new(pool: RedisPool, config: &QueueConfig) -> Self {
        let keys = Keys::new(config.namespace.clone());
        let store = JobStore::new(pool.clone(), keys.clone());
        let router = QueueRouter::new(pool.clone(), keys.clone());

        Self {
            pool,
            keys,
            store,
            router,
        }
    }

    /// Create a job and route it to its first destination: the per-name
    /// queue, or the scheduled set when `scheduled_for` is in the future.
    pub async fn create(
        &self,
        name: impl Into<String>,
        data: Option<serde_json::Value>,
        options: JobOptions,
    ) -> Result<JobRecord> {
        let mut record = JobRecord::new(name, data, &options)?;
        self.store.create(&mut record).await?;
        self.router.enqueue(&record).await?;

        info!(job_id = %record.id, job_name = %record.name, state = %record.state, "job created");
        Ok(record)
    }

    /// Fetch a job record by id.
    pub async fn fetch(&self, id: &str) -> Result<JobRecord> {
        self.store.fetch(id).await
    }

    /// Count jobs currently in the given state.
    pub async fn state_count(&self, state: JobState) -> Result<u64> {
        self.store.state_count(state).await
    }

    /// Connection pool this queue runs on.
    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    /// Key namer for this queue's namespace.
    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Record storage.
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Queue router.
    pub fn router(&self) -> &QueueRouter {
        &self.router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::error::Error;
    use uuid::Uuid;

    async fn test_queue() -> Option<JobQueue> {
        let pool = RedisPool::new(RedisConfig::development()).await.ok()?;
        let config = QueueConfig::with_namespace(format!("convtest:{}", Uuid::new_v4().simple()));
        Some(JobQueue::new(pool, &config))
    }

    #[tokio::test]
    async fn test_create_and_fetch() {
        let Some(queue) = test_queue().await else { return };

        let job = queue
            .create(
                "mail",
                Some(serde_json::json!({"to": "a@b.c"})),
                JobOptions::default().with_retry(3),
            )
            .await
            .unwrap();

        assert!(!job.id.is_empty());
        assert_eq!(job.state, JobState::New);

        let fetched = queue.fetch(&job.id).await.unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.data, job.data);
        assert_eq!(queue.state_count(JobState::New).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_requires_name() {
        let Some(queue) = test_queue().await else { return };

        let err = queue
            .create("", None, JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadArgument(_)));
    }

    #[tokio::test]
    async fn test_created_job_is_queued_fifo() {
        let Some(queue) = test_queue().await else { return };

        let first = queue.create("mail", None, JobOptions::default()).await.unwrap();
        let second = queue.create("mail", None, JobOptions::default()).await.unwrap();

        let mut conn = queue.pool().shared().await.unwrap();
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(queue.keys().queue("mail"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
