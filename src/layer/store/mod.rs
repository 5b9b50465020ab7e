//! Shared store primitives used by the distributed layer
//!
//! The distributed layer only needs atomic set and list operations plus key
//! expiry; any store offering these can back a cluster.

mod memory_store;
mod redis_store;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::redis::{PoolError, RedisHealthStats};

/// Error type for store round trips
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Store reachability, reported on `/health`
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub store: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisHealthStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_connections: Option<usize>,
}

/// Set, list and expiry primitives of the shared store
#[async_trait]
pub trait LayerStore: Send + Sync {
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Union of several sets in one round trip
    async fn set_union(&self, keys: &[String]) -> Result<Vec<String>, StoreError>;

    /// Reset the key's time to live. Missing keys are ignored.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Push onto the head of a list
    async fn list_push(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Pop from the tail of a list, waiting up to `timeout` for an element.
    /// `Ok(None)` means the wait timed out.
    async fn list_pop_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// Ping the store and report its health. Never fails.
    async fn health(&self) -> StoreHealth;
}
