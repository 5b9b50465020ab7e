//! Channel layer trait definition

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::store::StoreHealth;
use super::types::{LayerBackend, LayerError, Payload};

/// Group membership and message delivery engine.
///
/// Both backends push resolved deliveries onto the delivery queue they were
/// built with; the connection manager drains it.
#[async_trait]
pub trait ChannelLayer: Send + Sync {
    fn backend_type(&self) -> LayerBackend;

    /// Add `channel` to each group. Adding an existing member is a no-op.
    async fn group_add(&self, channel: &str, groups: &[&str]) -> Result<(), LayerError>;

    /// Remove `channel` from each group. Removing a non-member is a no-op.
    async fn group_discard(&self, channel: &str, groups: &[&str]) -> Result<(), LayerError>;

    /// Deliver `payload` once to every channel in the union of `groups`.
    /// May return before delivery happens.
    async fn group_send(&self, payload: Payload, groups: &[&str]) -> Result<(), LayerError>;

    /// Deliver `payload` to each channel.
    async fn send(&self, payload: Payload, channels: &[&str]) -> Result<(), LayerError>;

    /// Unordered, deduplicated snapshot of a group's members
    async fn get_channels(&self, group: &str) -> Result<Vec<String>, LayerError>;

    /// Mint a channel id, using `hint` as the local part when non-empty.
    fn new_channel(&self, hint: &str) -> String;

    /// Start background work. Returns once workers are spawned.
    async fn run(&self, cancel: CancellationToken) -> Result<(), LayerError>;

    /// Health of the shared store, if the layer uses one
    async fn store_health(&self) -> Option<StoreHealth> {
        None
    }
}
