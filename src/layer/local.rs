//! Single-process channel layer

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics::RoutingMetrics;

use super::traits::ChannelLayer;
use super::types::{random_id, Envelope, LayerBackend, LayerError, Payload, RANDOM_ID_LEN};

/// In-memory channel layer. Membership never expires and delivery happens
/// inline on the caller's task.
pub struct LocalLayer {
    /// group -> channels
    groups: DashMap<String, HashSet<String>>,
    deliveries: mpsc::Sender<Envelope>,
}

impl LocalLayer {
    pub fn new(deliveries: mpsc::Sender<Envelope>) -> Self {
        Self {
            groups: DashMap::new(),
            deliveries,
        }
    }

    /// Number of groups with at least one member
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    async fn deliver(&self, envelope: Envelope) -> Result<(), LayerError> {
        self.deliveries
            .send(envelope)
            .await
            .map_err(|_| LayerError::QueueClosed)?;
        RoutingMetrics::record_local();
        Ok(())
    }
}

#[async_trait]
impl ChannelLayer for LocalLayer {
    fn backend_type(&self) -> LayerBackend {
        LayerBackend::Local
    }

    async fn group_add(&self, channel: &str, groups: &[&str]) -> Result<(), LayerError> {
        for group in groups {
            // The entry guard holds the shard lock, so concurrent adds to
            // one group cannot lose updates.
            self.groups
                .entry(group.to_string())
                .or_default()
                .insert(channel.to_string());
        }
        Ok(())
    }

    async fn group_discard(&self, channel: &str, groups: &[&str]) -> Result<(), LayerError> {
        for group in groups {
            if let Entry::Occupied(mut members) = self.groups.entry(group.to_string()) {
                members.get_mut().remove(channel);
                if members.get().is_empty() {
                    members.remove();
                }
            }
        }
        Ok(())
    }

    async fn group_send(&self, payload: Payload, groups: &[&str]) -> Result<(), LayerError> {
        let channels: HashSet<String> = groups
            .iter()
            .filter_map(|group| self.groups.get(*group))
            .flat_map(|members| members.iter().cloned().collect::<Vec<_>>())
            .collect();

        if channels.is_empty() {
            tracing::debug!(groups = ?groups, "Group send matched no channels");
            return Ok(());
        }

        self.deliver(Envelope::to_channels(payload, channels.into_iter().collect()))
            .await
    }

    async fn send(&self, payload: Payload, channels: &[&str]) -> Result<(), LayerError> {
        for channel in channels {
            self.deliver(Envelope::to_channels(payload.clone(), vec![channel.to_string()]))
                .await?;
        }
        Ok(())
    }

    async fn get_channels(&self, group: &str) -> Result<Vec<String>, LayerError> {
        Ok(self
            .groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn new_channel(&self, hint: &str) -> String {
        if hint.is_empty() {
            random_id(RANDOM_ID_LEN)
        } else {
            hint.to_string()
        }
    }

    async fn run(&self, _cancel: CancellationToken) -> Result<(), LayerError> {
        // Delivery is synchronous; nothing to start
        Ok(())
    }
}
