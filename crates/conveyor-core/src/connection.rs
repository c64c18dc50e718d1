//! Redis connection management
//!
//! A thin pool around the `redis` crate: one shared multiplexed
//! [`ConnectionManager`] for regular commands, plus dedicated connections
//! for blocking pops so a `BLPOP` never stalls unrelated traffic.

use crate::config::RedisConfig;
use crate::error::{Error, Result};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Redis connection pool
#[derive(Clone)]
pub struct RedisPool {
    /// Redis client
    client: Client,

    /// Shared connection for non-blocking commands
    manager: Arc<RwLock<Option<ConnectionManager>>>,

    /// Configuration
    config: Arc<RedisConfig>,
}

impl RedisPool {
    /// Create a pool and establish the initial connection.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| Error::Storage(e.to_string()))?;

        let pool = Self {
            client,
            manager: Arc::new(RwLock::new(None)),
            config: Arc::new(config),
        };

        pool.reconnect().await?;
        info!(url = %pool.config.url, "redis pool created");

        Ok(pool)
    }

    /// Get the shared connection for regular commands. Cloning a
    /// [`ConnectionManager`] is cheap; concurrent callers multiplex over
    /// one socket.
    pub async fn shared(&self) -> Result<ConnectionManager> {
        if let Some(manager) = self.manager.read().await.as_ref() {
            return Ok(manager.clone());
        }

        self.reconnect().await?;
        self.manager
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::Storage("no redis connection available".to_string()))
    }

    /// Open a dedicated connection for blocking commands. `BLPOP` parks
    /// the whole connection, so it must never run on the shared one.
    pub async fn blocking(&self) -> Result<MultiplexedConnection> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(conn)
    }

    /// (Re)establish the shared connection, retrying up to the configured
    /// attempt count.
    pub async fn reconnect(&self) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(attempt, "redis connect attempt");

            match self.attempt_connect().await {
                Ok(manager) => {
                    *self.manager.write().await = Some(manager);
                    if attempt > 1 {
                        info!(attempt, "redis reconnected");
                    }
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, error = %err, "redis connect attempt failed");

                    if attempt >= self.config.max_retries {
                        return Err(Error::Storage(format!(
                            "failed to connect after {} attempts: {}",
                            attempt, err
                        )));
                    }

                    tokio::time::sleep(self.config.retry_delay()).await;
                }
            }
        }
    }

    /// Attempt a single connection, validated with PING.
    async fn attempt_connect(&self) -> Result<ConnectionManager> {
        let mut manager = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut manager)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        if pong != "PONG" {
            return Err(Error::Storage("redis PING failed".to_string()));
        }

        Ok(manager)
    }

    /// Check if the pool can reach Redis.
    pub async fn health_check(&self) -> bool {
        match self.shared().await {
            Ok(mut conn) => {
                let pong: std::result::Result<String, redis::RedisError> =
                    redis::cmd("PING").query_async(&mut conn).await;
                pong.is_ok()
            }
            Err(_) => false,
        }
    }

    /// Configured Redis URL.
    pub fn url(&self) -> &str {
        &self.config.url
    }
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool")
            .field("url", &self.config.url)
            .finish()
    }
}
