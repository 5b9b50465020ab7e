//! Redis connectivity for the distributed channel layer
//!
//! - `pool`: bounded pool of exclusively-owned connections
//! - `RedisHealth`: tracks whether Redis is reachable

mod health;
pub mod pool;

pub use health::{RedisHealth, RedisHealthStats, RedisHealthStatus};
pub use pool::{PoolError, PooledConnection, RedisPool};

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
