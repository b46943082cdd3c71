//! Redis cache store backed by a `deadpool-redis` pool.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands, RedisResult};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use tracing::debug;
use txoflow_sdk::TokenState;

use super::{CacheConfig, CacheError, CacheStore};
use crate::store::keys;

const SCAN_COUNT: usize = 500;

/// Redis-backed cache store.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
    config: CacheConfig,
}

impl RedisCache {
    /// Creates the connection pool.
    ///
    /// Connections are opened lazily, so an unreachable cache does not
    /// prevent startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let pool = Config::from_url(config.url.clone())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Pool(e.to_string()))?;
        Ok(Self { pool, config })
    }

    async fn conn(&self) -> Result<Connection, CacheError> {
        tokio::time::timeout(self.config.command_timeout, self.pool.get())
            .await
            .map_err(|_| CacheError::Timeout)?
            .map_err(|e| CacheError::Pool(e.to_string()))
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        tokio::time::timeout(self.config.command_timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout)?
            .map_err(|e| CacheError::Redis(e.to_string()))
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn put_states(&self, topic: &str, states: &[TokenState]) -> Result<(), CacheError> {
        if states.is_empty() {
            return Ok(());
        }

        let recent_key = keys::cache_recent(topic);
        let mut pipe = redis::pipe();
        for state in states {
            let key = keys::cache_state(topic, &state.holder);
            if state.is_empty() {
                pipe.del(&key).ignore();
            } else {
                let json = serde_json::to_string(state)?;
                match self.config.ttl {
                    Some(ttl) => pipe.set_ex(&key, json, Self::ttl_secs(ttl)),
                    None => pipe.set(&key, json),
                }
                .ignore();
            }
            pipe.lpush(&recent_key, &state.holder).ignore();
        }
        let last = self.config.recent_limit.saturating_sub(1) as isize;
        pipe.ltrim(&recent_key, 0, last).ignore();

        let mut conn = self.conn().await?;
        let _: () = self.timed(pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn get_state(
        &self,
        topic: &str,
        holder: &str,
    ) -> Result<Option<TokenState>, CacheError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = self
            .timed(conn.get(keys::cache_state(topic, holder)))
            .await?;
        Ok(raw.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    async fn recent_holders(&self, topic: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        let last = self.config.recent_limit.saturating_sub(1) as isize;
        self.timed(conn.lrange(keys::cache_recent(topic), 0, last))
            .await
    }

    async fn clear(&self, topic: &str) -> Result<u64, CacheError> {
        let pattern = keys::cache_pattern(topic);
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut removed = 0u64;

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .timed(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn),
                )
                .await?;
            if !batch.is_empty() {
                let deleted: u64 = self.timed(conn.del(&batch)).await?;
                removed = removed.saturating_add(deleted);
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        let recent: u64 = self.timed(conn.del(keys::cache_recent(topic))).await?;
        removed = removed.saturating_add(recent);

        debug!(topic, removed, "cache cleared");
        Ok(removed)
    }
}
