//! CRUD over job records in Redis
//!
//! The per-job hash carries two fields: `itemData`, the canonical record
//! serialization, and `state`, written on every transition. State
//! transitions are single-key writes; full-record saves are larger and may
//! be skipped on transient paths, so on fetch the `state` field wins when
//! the two disagree.

use crate::connection::RedisPool;
use crate::error::{Error, Result};
use crate::job::{JobRecord, JobState};
use crate::keys::Keys;
use tracing::debug;

/// Job record storage backed by Redis
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: RedisPool,
    keys: Keys,
}

impl JobStore {
    /// Create a store over the given pool and key namespace.
    pub fn new(pool: RedisPool, keys: Keys) -> Self {
        Self { pool, keys }
    }

    /// Persist a new record: allocate the next id, write the record hash,
    /// add the id to the per-state index and the creation-time index.
    ///
    /// Steps are issued in order; the first failure surfaces as a storage
    /// error and nothing is retried.
    pub async fn create(&self, record: &mut JobRecord) -> Result<String> {
        let mut conn = self.pool.shared().await?;

        let id: i64 = redis::cmd("INCR")
            .arg(self.keys.id_counter())
            .query_async(&mut conn)
            .await?;
        record.id = id.to_string();

        let payload = record.to_json()?;
        let _: () = redis::cmd("HSET")
            .arg(self.keys.job(&record.id))
            .arg("itemData")
            .arg(&payload)
            .arg("state")
            .arg(record.state.as_str())
            .query_async(&mut conn)
            .await?;

        let _: () = redis::cmd("SADD")
            .arg(self.keys.state(record.state))
            .arg(&record.id)
            .query_async(&mut conn)
            .await?;

        self.index_time(record).await?;

        debug!(job_id = %record.id, job_name = %record.name, state = %record.state, "job record created");
        Ok(record.id.clone())
    }

    /// Load a record by id. The hash's `state` field overrides the state
    /// inside `itemData`.
    pub async fn fetch(&self, id: &str) -> Result<JobRecord> {
        let mut conn = self.pool.shared().await?;

        let (item_data, state): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.keys.job(id))
            .arg("itemData")
            .arg("state")
            .query_async(&mut conn)
            .await?;

        let payload = item_data.ok_or_else(|| Error::NotFound(id.to_string()))?;
        let mut record = JobRecord::from_json(&payload)?;

        if record.id != id {
            // data skew between the key and the stored payload
            return Err(Error::NotFound(id.to_string()));
        }

        if let Some(raw) = state {
            record.state = JobState::parse(&raw)
                .ok_or_else(|| Error::Corrupt(format!("unknown state '{}' for job {}", raw, id)))?;
        }

        Ok(record)
    }

    /// Write the record payload only. Callers changing state must also
    /// call [`JobStore::update_state_index`].
    pub async fn save(&self, record: &JobRecord) -> Result<()> {
        let mut conn = self.pool.shared().await?;
        let payload = record.to_json()?;

        let _: () = redis::cmd("HSET")
            .arg(self.keys.job(&record.id))
            .arg("itemData")
            .arg(&payload)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    /// Move the record between per-state index sets and write the hash
    /// `state` field, as an old-state to new-state transition. On success
    /// the in-memory record carries the new state.
    pub async fn update_state_index(
        &self,
        record: &mut JobRecord,
        new_state: JobState,
    ) -> Result<()> {
        let mut conn = self.pool.shared().await?;
        let old_state = record.state;

        let mut pipe = redis::pipe();
        if old_state != new_state {
            pipe.cmd("SREM")
                .arg(self.keys.state(old_state))
                .arg(&record.id)
                .ignore();
        }
        pipe.cmd("SADD")
            .arg(self.keys.state(new_state))
            .arg(&record.id)
            .ignore();
        pipe.cmd("HSET")
            .arg(self.keys.job(&record.id))
            .arg("state")
            .arg(new_state.as_str())
            .ignore();

        let _: () = pipe.query_async(&mut conn).await?;

        record.state = new_state;
        debug!(job_id = %record.id, from = %old_state, to = %new_state, "state index updated");
        Ok(())
    }

    /// Index the record id by its creation time.
    pub async fn index_time(&self, record: &JobRecord) -> Result<()> {
        let mut conn = self.pool.shared().await?;

        let _: () = redis::cmd("ZADD")
            .arg(self.keys.time_index())
            .arg(record.create_time)
            .arg(&record.id)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    /// Count ids currently indexed under the given state.
    pub async fn state_count(&self, state: JobState) -> Result<u64> {
        let mut conn = self.pool.shared().await?;

        let count: u64 = redis::cmd("SCARD")
            .arg(self.keys.state(state))
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    /// Ids of all jobs currently indexed under the given state.
    pub async fn state_members(&self, state: JobState) -> Result<Vec<String>> {
        let mut conn = self.pool.shared().await?;

        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.state(state))
            .query_async(&mut conn)
            .await?;

        Ok(ids)
    }

    /// Ids created inside the given time range (ms, inclusive), oldest
    /// first.
    pub async fn created_in_range(&self, from: i64, to: i64, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.pool.shared().await?;

        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.time_index())
            .arg(from)
            .arg(to)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        Ok(ids)
    }

    /// Key namer this store writes under.
    pub fn keys(&self) -> &Keys {
        &self.keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobOptions, RedisConfig};
    use crate::job::now_ms;
    use uuid::Uuid;

    fn test_keys() -> Keys {
        Keys::new(format!("convtest:{}", Uuid::new_v4().simple()))
    }

    async fn test_pool() -> Option<RedisPool> {
        RedisPool::new(RedisConfig::development()).await.ok()
    }

    fn sample_record() -> JobRecord {
        JobRecord::new(
            "mail",
            Some(serde_json::json!("hi")),
            &JobOptions::default().with_retry(3),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_allocates_distinct_ids() {
        let Some(pool) = test_pool().await else { return };
        let store = JobStore::new(pool, test_keys());

        let mut a = sample_record();
        let mut b = sample_record();
        let id_a = store.create(&mut a).await.unwrap();
        let id_b = store.create(&mut b).await.unwrap();

        assert!(!id_a.is_empty());
        assert_ne!(id_a, id_b);
        assert_eq!(store.state_count(JobState::New).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fetch_after_create_roundtrips() {
        let Some(pool) = test_pool().await else { return };
        let store = JobStore::new(pool, test_keys());

        let mut record = sample_record();
        let id = store.create(&mut record).await.unwrap();

        let fetched = store.fetch(&id).await.unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.name, record.name);
        assert_eq!(fetched.data, record.data);
        assert_eq!(fetched.state, JobState::New);
        assert_eq!(fetched.retry_times, 3);
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let Some(pool) = test_pool().await else { return };
        let store = JobStore::new(pool, test_keys());

        let err = store.fetch("9999").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_state_field_wins_over_item_data() {
        let Some(pool) = test_pool().await else { return };
        let keys = test_keys();
        let store = JobStore::new(pool.clone(), keys.clone());

        let mut record = sample_record();
        let id = store.create(&mut record).await.unwrap();

        // A transition that only touched the state field.
        let mut conn = pool.shared().await.unwrap();
        let _: () = redis::cmd("HSET")
            .arg(keys.job(&id))
            .arg("state")
            .arg("queued")
            .query_async(&mut conn)
            .await
            .unwrap();

        let fetched = store.fetch(&id).await.unwrap();
        assert_eq!(fetched.state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_fetch_corrupt_payload() {
        let Some(pool) = test_pool().await else { return };
        let keys = test_keys();
        let store = JobStore::new(pool.clone(), keys.clone());

        let mut conn = pool.shared().await.unwrap();
        let _: () = redis::cmd("HSET")
            .arg(keys.job("5"))
            .arg("itemData")
            .arg("{not json")
            .arg("state")
            .arg("new")
            .query_async(&mut conn)
            .await
            .unwrap();

        let err = store.fetch("5").await.unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_fetch_id_skew_is_not_found() {
        let Some(pool) = test_pool().await else { return };
        let keys = test_keys();
        let store = JobStore::new(pool.clone(), keys.clone());

        let mut record = sample_record();
        record.id = "1".to_string();
        let payload = record.to_json().unwrap();

        let mut conn = pool.shared().await.unwrap();
        let _: () = redis::cmd("HSET")
            .arg(keys.job("2"))
            .arg("itemData")
            .arg(&payload)
            .arg("state")
            .arg("new")
            .query_async(&mut conn)
            .await
            .unwrap();

        let err = store.fetch("2").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_state_index_moves_membership() {
        let Some(pool) = test_pool().await else { return };
        let store = JobStore::new(pool, test_keys());

        let mut record = sample_record();
        let id = store.create(&mut record).await.unwrap();

        store
            .update_state_index(&mut record, JobState::Processing)
            .await
            .unwrap();

        assert_eq!(record.state, JobState::Processing);
        assert_eq!(store.state_count(JobState::New).await.unwrap(), 0);
        assert_eq!(store.state_count(JobState::Processing).await.unwrap(), 1);
        assert_eq!(
            store.state_members(JobState::Processing).await.unwrap(),
            vec![id.clone()]
        );

        // The state field is authoritative on the next fetch.
        let fetched = store.fetch(&id).await.unwrap();
        assert_eq!(fetched.state, JobState::Processing);
    }

    #[tokio::test]
    async fn test_save_preserves_separate_state() {
        let Some(pool) = test_pool().await else { return };
        let store = JobStore::new(pool, test_keys());

        let mut record = sample_record();
        let id = store.create(&mut record).await.unwrap();
        store
            .update_state_index(&mut record, JobState::Queued)
            .await
            .unwrap();

        // Save a stale in-memory copy claiming state `new`.
        let mut stale = record.clone();
        stale.state = JobState::New;
        store.save(&stale).await.unwrap();

        let fetched = store.fetch(&id).await.unwrap();
        assert_eq!(fetched.state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_created_in_range() {
        let Some(pool) = test_pool().await else { return };
        let store = JobStore::new(pool, test_keys());

        let before = now_ms();
        let mut record = sample_record();
        let id = store.create(&mut record).await.unwrap();

        let ids = store
            .created_in_range(before - 1000, now_ms() + 1000, 10)
            .await
            .unwrap();
        assert_eq!(ids, vec![id]);
    }
}
