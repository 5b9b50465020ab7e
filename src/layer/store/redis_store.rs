//! Redis-backed store

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::{Cmd, FromRedisValue};

use crate::redis::RedisPool;

use super::{LayerStore, StoreError, StoreHealth};

/// Upper bound on the `/health` round trip
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// [`LayerStore`] on top of a [`RedisPool`]
pub struct RedisStore {
    pool: Arc<RedisPool>,
}

impl RedisStore {
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self { pool }
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, StoreError> {
        let mut conn = self.pool.get().await?;
        match cmd.query_async(&mut *conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.pool.record_error(&mut conn, &e);
                Err(StoreError::Redis(e))
            }
        }
    }
}

#[async_trait]
impl LayerStore for RedisStore {
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.query(redis::cmd("SADD").arg(key).arg(member)).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.query(redis::cmd("SREM").arg(key).arg(member)).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.query(redis::cmd("SMEMBERS").arg(key)).await
    }

    async fn set_union(&self, keys: &[String]) -> Result<Vec<String>, StoreError> {
        self.query(redis::cmd("SUNION").arg(keys)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.query(redis::cmd("PEXPIRE").arg(key).arg(ttl.as_millis() as u64))
            .await
    }

    async fn list_push(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.query(redis::cmd("LPUSH").arg(key).arg(value)).await
    }

    async fn list_pop_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.pool.get().await?;
        // If this future is dropped mid-wait the server may still pop an
        // element for this connection, so it must not be reused.
        conn.mark_broken();

        let result: Result<Option<(String, Vec<u8>)>, _> = redis::cmd("BRPOP")
            .arg(key)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut *conn)
            .await;

        match result {
            Ok(popped) => {
                conn.restore();
                Ok(popped.map(|(_, value)| value))
            }
            Err(e) => {
                self.pool.record_error(&mut conn, &e);
                Err(StoreError::Redis(e))
            }
        }
    }

    async fn health(&self) -> StoreHealth {
        // Failed dials and dropped connections are recorded by the pool
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.pool.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Redis health check failed"),
            Err(_) => tracing::warn!("Redis health check timed out"),
        }

        let health = self.pool.health();
        StoreHealth {
            store: "redis",
            healthy: health.is_healthy(),
            redis: Some(health.stats()),
            idle_connections: Some(self.pool.idle_count()),
        }
    }
}
