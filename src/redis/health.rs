//! Redis connection health tracking

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use serde::Serialize;

use super::current_time_ms;

/// Redis connection health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RedisHealthStatus {
    /// Last dial or command succeeded
    Healthy = 0,
    /// No connection has been established yet
    Connecting = 1,
    /// Last dial failed or a connection was dropped
    Unavailable = 2,
}

impl From<u8> for RedisHealthStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => RedisHealthStatus::Healthy,
            2 => RedisHealthStatus::Unavailable,
            _ => RedisHealthStatus::Connecting,
        }
    }
}

/// Redis health tracker shared by the pool and its callers
pub struct RedisHealth {
    status: AtomicU8,
    last_connected: AtomicI64,
    connections_opened: AtomicU32,
    consecutive_failures: AtomicU32,
}

impl RedisHealth {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(RedisHealthStatus::Connecting as u8),
            last_connected: AtomicI64::new(0),
            connections_opened: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Record a freshly dialed connection
    pub fn record_connected(&self) {
        self.status
            .store(RedisHealthStatus::Healthy as u8, Ordering::Release);
        self.last_connected
            .store(current_time_ms(), Ordering::Release);
        self.connections_opened.fetch_add(1, Ordering::AcqRel);
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Record a successful round trip on an existing connection
    pub fn record_success(&self) {
        self.status
            .store(RedisHealthStatus::Healthy as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Record a failed dial or a dropped connection
    pub fn record_failure(&self) {
        self.status
            .store(RedisHealthStatus::Unavailable as u8, Ordering::Release);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
    }

    pub fn status(&self) -> RedisHealthStatus {
        RedisHealthStatus::from(self.status.load(Ordering::Acquire))
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == RedisHealthStatus::Healthy
    }

    pub fn stats(&self) -> RedisHealthStats {
        RedisHealthStats {
            status: self.status(),
            last_connected_ms: self.last_connected.load(Ordering::Acquire),
            connections_opened: self.connections_opened.load(Ordering::Acquire),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
        }
    }
}

impl Default for RedisHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Redis health statistics
#[derive(Debug, Clone, Serialize)]
pub struct RedisHealthStats {
    pub status: RedisHealthStatus,
    pub last_connected_ms: i64,
    pub connections_opened: u32,
    pub consecutive_failures: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_health_status() {
        let health = RedisHealth::new();
        assert_eq!(health.status(), RedisHealthStatus::Connecting);
        assert!(!health.is_healthy());

        health.record_connected();
        assert!(health.is_healthy());

        health.record_failure();
        assert_eq!(health.status(), RedisHealthStatus::Unavailable);
        assert_eq!(
            serde_json::to_value(health.status()).unwrap(),
            serde_json::json!("unavailable")
        );

        health.record_success();
        assert!(health.is_healthy());
        assert_eq!(health.stats().connections_opened, 1);
    }

    #[test]
    fn test_redis_health_stats() {
        let health = RedisHealth::new();

        health.record_failure();
        health.record_failure();
        assert_eq!(health.stats().consecutive_failures, 2);

        health.record_connected();
        let stats = health.stats();
        assert_eq!(stats.status, RedisHealthStatus::Healthy);
        assert_eq!(stats.connections_opened, 1);
        assert_eq!(stats.consecutive_failures, 0); // Reset on connect
        assert!(stats.last_connected_ms > 0);
    }
}
