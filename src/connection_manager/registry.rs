use dashmap::DashMap;
use std::sync::Arc;

use crate::metrics::ConnectionMetrics;

use super::connection::Connection;

/// Live connections on this process, keyed by channel
#[derive(Default)]
pub struct ConnectionRegistry {
    /// channel -> Connection
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns the connection previously bound to the
    /// same channel, if any.
    pub fn insert(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let previous = self
            .connections
            .insert(conn.channel().to_string(), conn.clone());

        if previous.is_none() {
            ConnectionMetrics::record_opened();
        }
        tracing::debug!(channel = %conn.channel(), "Connection registered");
        previous
    }

    /// Look up a connection; the returned handle does not hold the map lock.
    pub fn get(&self, channel: &str) -> Option<Arc<Connection>> {
        self.connections.get(channel).map(|c| c.clone())
    }

    /// Remove `conn` only if its channel still maps to this exact connection,
    /// so a late cleanup never evicts a newer connection on the same channel.
    pub fn remove(&self, conn: &Arc<Connection>) -> bool {
        let removed = self
            .connections
            .remove_if(conn.channel(), |_, current| Arc::ptr_eq(current, conn))
            .is_some();

        if removed {
            ConnectionMetrics::record_removed();
            tracing::debug!(channel = %conn.channel(), "Connection unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn channels(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }
}
