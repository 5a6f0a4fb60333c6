//! Shared durable store (L2)
//!
//! The cache talks to the remote tier only through [`RemoteStore`]. The
//! production implementation is [`RedisStore`]; request timeouts belong to its
//! connection configuration, not to the cache.

use futures::StreamExt;
use redis::{
    AsyncCommands,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use std::time::Duration;
use tracing::debug;

use crate::{CacheError, Ttl};

/// A shared key-value store holding encoded values
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Fetch the encoded value for `key`, or `None` if the store has none
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store an encoded value, expiring after `expiry` unless unbounded
    async fn set(&self, key: &str, payload: String, expiry: Ttl) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Count stored keys. May scan the whole keyspace.
    async fn count_keys(&self) -> Result<u64, CacheError>;
}

/// Connection settings for [`RedisStore`]
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix prepended to every cache key (e.g. `"cache:session:"`)
    pub key_prefix: String,
    pub connection_timeout: Duration,
    /// Upper bound on a single request; a refresh that hits it keeps the stale value
    pub response_timeout: Duration,
    /// Reconnection attempts made by the connection manager
    pub number_of_retries: usize,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            connection_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            number_of_retries: 3,
        }
    }
}

/// Redis-backed remote store
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    pub async fn connect(
        redis_client: redis::Client,
        config: RedisStoreConfig,
    ) -> Result<Self, redis::RedisError> {
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(config.connection_timeout)
            .set_response_timeout(config.response_timeout)
            .set_number_of_retries(config.number_of_retries);
        let conn = ConnectionManager::new_with_config(redis_client, manager_config).await?;

        Ok(Self {
            conn,
            key_prefix: config.key_prefix,
        })
    }

    fn format_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait::async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value = conn.get::<_, Option<String>>(self.format_key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, payload: String, expiry: Ttl) -> Result<(), CacheError> {
        let redis_key = self.format_key(key);
        let mut conn = self.conn.clone();
        match expiry.duration() {
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                conn.pset_ex::<_, _, ()>(&redis_key, payload, millis).await?;
            }
            None => {
                conn.set::<_, _, ()>(&redis_key, payload).await?;
            }
        }
        debug!("Redis SET for key {} (Redis key: {})", key, redis_key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.format_key(key)).await?;
        Ok(())
    }

    async fn count_keys(&self) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        if self.key_prefix.is_empty() {
            let count = redis::cmd("DBSIZE").query_async::<u64>(&mut conn).await?;
            return Ok(count);
        }

        let pattern = format!("{}*", self.key_prefix);
        let keys = conn.scan_match::<_, String>(pattern).await?;
        let count = keys.count().await;
        Ok(count as u64)
    }
}
