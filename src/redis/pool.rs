//! Bounded Redis connection pool.
//!
//! Every checkout hands out a connection used by one caller at a time, so
//! blocking commands such as `BRPOP` never stall other callers. The pool caps
//! the number of checked-out connections (`max_active`), keeps at most
//! `max_idle` connections around for reuse and drops idle ones older than
//! `idle_timeout`.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

use crate::config::RedisConfig;

use super::RedisHealth;

/// Error type for Redis pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// All `max_active` connections are checked out and the pool does not wait
    #[error("Connection pool exhausted ({max_active} active)")]
    Exhausted { max_active: usize },

    /// The pool has been shut down
    #[error("Connection pool closed")]
    Closed,
}

struct IdleConnection {
    conn: MultiplexedConnection,
    returned_at: Instant,
}

struct IdleList {
    connections: Mutex<Vec<IdleConnection>>,
    max_idle: usize,
    idle_timeout: Duration,
}

impl IdleList {
    fn take(&self) -> Option<MultiplexedConnection> {
        let mut idle = self.connections.lock();
        let now = Instant::now();
        idle.retain(|c| now.duration_since(c.returned_at) < self.idle_timeout);
        // Most recently returned first
        idle.pop().map(|c| c.conn)
    }

    fn put(&self, conn: MultiplexedConnection) {
        let mut idle = self.connections.lock();
        if idle.len() < self.max_idle {
            idle.push(IdleConnection {
                conn,
                returned_at: Instant::now(),
            });
        }
    }

    fn len(&self) -> usize {
        self.connections.lock().len()
    }
}

/// Redis connection pool for the distributed channel layer.
pub struct RedisPool {
    client: Client,
    idle: Arc<IdleList>,
    /// `None` when `max_active` is 0 (unbounded)
    active: Option<Arc<Semaphore>>,
    health: Arc<RedisHealth>,
    config: RedisConfig,
}

impl RedisPool {
    /// Create a new Redis pool. No connection is dialed until first use.
    pub fn new(config: RedisConfig, health: Arc<RedisHealth>) -> Result<Self, PoolError> {
        let client = Client::open(config.url.as_str())?;
        let active = (config.max_active > 0).then(|| Arc::new(Semaphore::new(config.max_active)));

        Ok(Self {
            client,
            idle: Arc::new(IdleList {
                connections: Mutex::new(Vec::new()),
                max_idle: config.max_idle,
                idle_timeout: config.idle_timeout(),
            }),
            active,
            health,
            config,
        })
    }

    /// Check out a connection, reusing an idle one when possible.
    pub async fn get(&self) -> Result<PooledConnection, PoolError> {
        let permit = self.acquire_slot().await?;

        if let Some(conn) = self.idle.take() {
            return Ok(PooledConnection::new(conn, self.idle.clone(), permit));
        }

        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                self.health.record_connected();
                tracing::debug!(url = %self.config.url, "Redis pool connection established");
                Ok(PooledConnection::new(conn, self.idle.clone(), permit))
            }
            Err(e) => {
                self.health.record_failure();
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    async fn acquire_slot(&self) -> Result<Option<OwnedSemaphorePermit>, PoolError> {
        let Some(semaphore) = &self.active else {
            return Ok(None);
        };

        if self.config.wait {
            semaphore
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| PoolError::Closed)
        } else {
            match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Ok(Some(permit)),
                Err(TryAcquireError::NoPermits) => Err(PoolError::Exhausted {
                    max_active: self.config.max_active,
                }),
                Err(TryAcquireError::Closed) => Err(PoolError::Closed),
            }
        }
    }

    /// Record a command failure against pool health. Dropped connections
    /// are not returned to the idle list.
    pub fn record_error(&self, conn: &mut PooledConnection, error: &RedisError) {
        if error.is_connection_dropped() || error.is_io_error() {
            conn.mark_broken();
            self.health.record_failure();
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Connections that can still be checked out without waiting, if bounded.
    pub fn available_slots(&self) -> Option<usize> {
        self.active.as_ref().map(|s| s.available_permits())
    }

    pub fn health(&self) -> &Arc<RedisHealth> {
        &self.health
    }

    /// Ping Redis to check connectivity.
    pub async fn ping(&self) -> Result<(), PoolError> {
        let mut conn = self.get().await?;
        let result: Result<String, RedisError> = redis::cmd("PING").query_async(&mut *conn).await;
        match result {
            Ok(_) => {
                self.health.record_success();
                Ok(())
            }
            Err(e) => {
                self.record_error(&mut conn, &e);
                Err(e.into())
            }
        }
    }
}

/// A checked-out connection. Returned to the idle list on drop unless broken.
pub struct PooledConnection {
    conn: MultiplexedConnection,
    idle: Arc<IdleList>,
    broken: bool,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    fn new(
        conn: MultiplexedConnection,
        idle: Arc<IdleList>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            conn,
            idle,
            broken: false,
            _permit: permit,
        }
    }

    /// Prevent this connection from being reused.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Undo [`mark_broken`](Self::mark_broken) once a command completed cleanly.
    pub fn restore(&mut self) {
        self.broken = false;
    }
}

impl Deref for PooledConnection {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.broken {
            self.idle.put(self.conn.clone());
        }
    }
}
