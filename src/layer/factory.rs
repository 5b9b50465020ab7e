//! Factory function for creating channel layers

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{LayerBackendKind, LayerConfig, RedisConfig};
use crate::redis::{RedisHealth, RedisPool};

use super::distributed::DistributedLayer;
use super::local::LocalLayer;
use super::store::RedisStore;
use super::traits::ChannelLayer;
use super::types::{Envelope, LayerError};

/// Create a channel layer based on configuration.
///
/// Resolved deliveries are pushed onto `deliveries`. A Redis backend with a
/// missing or malformed URL is rejected here, before anything is started.
pub fn create_layer(
    config: &LayerConfig,
    redis: &RedisConfig,
    deliveries: mpsc::Sender<Envelope>,
) -> Result<Arc<dyn ChannelLayer>, LayerError> {
    match config.backend {
        LayerBackendKind::Memory => {
            tracing::info!("Using local channel layer");
            Ok(Arc::new(LocalLayer::new(deliveries)))
        }
        LayerBackendKind::Redis => {
            if redis.url.trim().is_empty() {
                return Err(LayerError::Config(
                    "redis backend selected but no redis url configured".into(),
                ));
            }

            let pool = RedisPool::new(redis.clone(), Arc::new(RedisHealth::new()))
                .map_err(|e| LayerError::Config(format!("invalid redis url: {}", e)))?;

            tracing::info!(
                url = %redis.url,
                max_active = redis.max_active,
                max_idle = redis.max_idle,
                "Using distributed channel layer on Redis"
            );

            let store = Arc::new(RedisStore::new(Arc::new(pool)));
            Ok(Arc::new(DistributedLayer::new(store, config, deliveries)?))
        }
    }
}
