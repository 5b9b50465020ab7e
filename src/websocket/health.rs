//! Health endpoint

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::connection_manager::ConnectionManager;
use crate::layer::{LayerBackend, StoreHealth};

#[derive(Debug, Serialize)]
pub struct HealthReport {
    /// `healthy`, or `degraded` when the shared store is unreachable
    pub status: &'static str,
    pub version: &'static str,
    pub backend: LayerBackend,
    pub connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreHealth>,
}

impl HealthReport {
    pub async fn collect(manager: &ConnectionManager) -> Self {
        let store = manager.layer().store_health().await;
        let healthy = store.as_ref().map_or(true, |s| s.healthy);

        Self {
            status: if healthy { "healthy" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            backend: manager.layer().backend_type(),
            connections: manager.connection_count(),
            store,
        }
    }
}

pub async fn health(State(manager): State<Arc<ConnectionManager>>) -> Json<HealthReport> {
    Json(HealthReport::collect(&manager).await)
}
