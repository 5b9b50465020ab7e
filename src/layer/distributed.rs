//! Store-backed channel layer for multi-process deployments.
//!
//! Each process owns a random prefix that it embeds in every channel it
//! mints (`<prefix>!<suffix>`). Deliveries to channels owned by this process
//! go straight onto the local delivery queue; everything else is serialized
//! and pushed onto the owning process's inbox list in the store, where that
//! process's receive workers pop it.
//!
//! Group sends are accepted onto a bounded queue and resolved by a pool of
//! send workers, so `group_send` returning `Ok` means "accepted", not
//! "delivered".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::config::LayerConfig;
use crate::metrics::RoutingMetrics;
use crate::supervisor::{RestartPolicy, WorkerPool, WorkerResult};

use super::store::{LayerStore, StoreHealth};
use super::traits::ChannelLayer;
use super::types::{
    owner_prefix, random_id, Envelope, LayerBackend, LayerError, Payload, CHANNEL_DELIMITER,
    RANDOM_ID_LEN,
};

/// Queued group send awaiting membership resolution
struct GroupSendRequest {
    groups: Vec<String>,
    payload: Payload,
}

type RequestQueue = Arc<AsyncMutex<mpsc::Receiver<GroupSendRequest>>>;

/// State shared between the layer handle and its workers
struct Shared {
    store: Arc<dyn LayerStore>,
    prefix: String,
    namespace: String,
    group_expiry: Duration,
    pop_timeout: Duration,
    must_send_remote: AtomicBool,
    deliveries: mpsc::Sender<Envelope>,
}

impl Shared {
    fn group_key(&self, group: &str) -> String {
        format!("{}:group:{}", self.namespace, group)
    }

    fn inbox_key(&self, prefix: &str) -> String {
        format!("{}:inbox:{}", self.namespace, prefix)
    }

    /// Deliver an envelope whose channels are all owned by `owner`.
    async fn route(&self, owner: &str, envelope: Envelope) -> Result<(), LayerError> {
        if owner == self.prefix && !self.must_send_remote.load(Ordering::Acquire) {
            self.deliveries
                .send(envelope)
                .await
                .map_err(|_| LayerError::QueueClosed)?;
            RoutingMetrics::record_local();
            return Ok(());
        }

        let key = self.inbox_key(owner);
        self.store.list_push(&key, envelope.to_wire()?).await?;
        self.store.expire(&key, self.group_expiry).await?;
        RoutingMetrics::record_remote();
        tracing::debug!(owner = %owner, channels = envelope.channels.len(), "Envelope relayed");
        Ok(())
    }

    /// Members of the union of `groups`, in one store round trip.
    async fn resolve(&self, groups: &[String]) -> Result<Vec<String>, LayerError> {
        let channels = match groups {
            [group] => self.store.set_members(&self.group_key(group)).await?,
            _ => {
                let keys: Vec<String> = groups.iter().map(|g| self.group_key(g)).collect();
                self.store.set_union(&keys).await?
            }
        };
        Ok(channels)
    }

    /// Resolve a group send and route one envelope per owning process.
    async fn fan_out(&self, request: GroupSendRequest) -> Result<(), LayerError> {
        let channels = match self.resolve(&request.groups).await {
            Ok(channels) => channels,
            Err(e) => {
                RoutingMetrics::record_resolution_failure();
                tracing::warn!(groups = ?request.groups, error = %e, "Group send resolution failed, skipping");
                return Ok(());
            }
        };

        let mut by_owner: HashMap<String, Vec<String>> = HashMap::new();
        for channel in channels {
            by_owner
                .entry(owner_prefix(&channel).to_string())
                .or_default()
                .push(channel);
        }

        for (owner, channels) in by_owner {
            let envelope = Envelope::to_channels(request.payload.clone(), channels);
            match self.route(&owner, envelope).await {
                Ok(()) => {}
                Err(LayerError::QueueClosed) => return Err(LayerError::QueueClosed),
                Err(e) => {
                    tracing::warn!(owner = %owner, error = %e, "Failed to route group send partition");
                }
            }
        }
        Ok(())
    }

    async fn send_worker(self: Arc<Self>, requests: RequestQueue, cancel: CancellationToken) -> WorkerResult {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                request = async { requests.lock().await.recv().await } => request,
            };

            let Some(request) = request else {
                // Layer handle dropped; idle until shutdown
                cancel.cancelled().await;
                return Ok(());
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.fan_out(request) => result?,
            }
        }
    }

    async fn receive_once(&self, inbox: &str) -> Result<(), LayerError> {
        let Some(bytes) = self.store.list_pop_blocking(inbox, self.pop_timeout).await? else {
            return Ok(());
        };

        let envelope = match Envelope::from_wire(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                RoutingMetrics::record_decode_failure();
                tracing::warn!(inbox = %inbox, error = %e, "Dropping undecodable relay record");
                return Ok(());
            }
        };

        RoutingMetrics::record_received();
        self.deliveries
            .send(envelope)
            .await
            .map_err(|_| LayerError::QueueClosed)
    }

    async fn receive_worker(self: Arc<Self>, cancel: CancellationToken) -> WorkerResult {
        let inbox = self.inbox_key(&self.prefix);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = self.receive_once(&inbox) => result?,
            }
        }
    }
}

/// Distributed channel layer over a [`LayerStore`]
pub struct DistributedLayer {
    shared: Arc<Shared>,
    group_sends: mpsc::Sender<GroupSendRequest>,
    pending: Mutex<Option<mpsc::Receiver<GroupSendRequest>>>,
    pools: Mutex<Vec<WorkerPool>>,
    send_workers: usize,
    receive_workers: usize,
    restart: RestartPolicy,
}

impl DistributedLayer {
    pub fn new(
        store: Arc<dyn LayerStore>,
        config: &LayerConfig,
        deliveries: mpsc::Sender<Envelope>,
    ) -> Result<Self, LayerError> {
        let prefix = match &config.process_prefix {
            Some(prefix) if prefix.is_empty() => {
                return Err(LayerError::Config("process prefix must not be empty".into()))
            }
            Some(prefix) if prefix.contains(CHANNEL_DELIMITER) => {
                return Err(LayerError::Config(format!(
                    "process prefix {:?} contains the channel delimiter '{}'",
                    prefix, CHANNEL_DELIMITER
                )))
            }
            Some(prefix) => prefix.clone(),
            None => random_id(RANDOM_ID_LEN),
        };

        if config.send_workers == 0 || config.receive_workers == 0 {
            return Err(LayerError::Config("worker pools need at least one worker".into()));
        }
        if config.group_send_buffer == 0 {
            return Err(LayerError::Config("group send buffer must be positive".into()));
        }
        // PEXPIRE 0 deletes the key
        if config.group_expiry_seconds == 0 {
            return Err(LayerError::Config("group expiry must be positive".into()));
        }
        if config.restart_delay_ms == 0 {
            return Err(LayerError::Config("worker restart delay must be positive".into()));
        }

        let (group_sends, pending) = mpsc::channel(config.group_send_buffer);

        tracing::info!(
            prefix = %prefix,
            namespace = %config.key_namespace,
            send_workers = config.send_workers,
            receive_workers = config.receive_workers,
            "Distributed channel layer created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                prefix,
                namespace: config.key_namespace.clone(),
                group_expiry: config.group_expiry(),
                pop_timeout: config.pop_timeout(),
                must_send_remote: AtomicBool::new(config.must_send_remote),
                deliveries,
            }),
            group_sends,
            pending: Mutex::new(Some(pending)),
            pools: Mutex::new(Vec::new()),
            send_workers: config.send_workers,
            receive_workers: config.receive_workers,
            restart: RestartPolicy::with_delay(config.restart_delay()),
        })
    }

    /// This process's channel prefix
    pub fn prefix(&self) -> &str {
        &self.shared.prefix
    }

    /// Force every delivery through the store, even to local channels.
    pub fn set_must_send_remote(&self, enabled: bool) {
        self.shared.must_send_remote.store(enabled, Ordering::Release);
    }

    pub fn must_send_remote(&self) -> bool {
        self.shared.must_send_remote.load(Ordering::Acquire)
    }

    /// Workers currently running across both pools
    pub fn live_workers(&self) -> usize {
        self.pools.lock().iter().map(|p| p.live_workers()).sum()
    }

    /// Worker replacements across both pools
    pub fn worker_restarts(&self) -> u64 {
        self.pools.lock().iter().map(|p| p.restarts()).sum()
    }

    /// Wait for the worker pools to stop after the run token is cancelled.
    pub async fn join(&self) {
        let pools = std::mem::take(&mut *self.pools.lock());
        for pool in pools {
            pool.join().await;
        }
    }
}

#[async_trait]
impl ChannelLayer for DistributedLayer {
    fn backend_type(&self) -> LayerBackend {
        LayerBackend::Distributed
    }

    async fn group_add(&self, channel: &str, groups: &[&str]) -> Result<(), LayerError> {
        for group in groups {
            let key = self.shared.group_key(group);
            self.shared.store.set_add(&key, channel).await?;
            self.shared
                .store
                .expire(&key, self.shared.group_expiry)
                .await?;
        }
        Ok(())
    }

    async fn group_discard(&self, channel: &str, groups: &[&str]) -> Result<(), LayerError> {
        for group in groups {
            self.shared
                .store
                .set_remove(&self.shared.group_key(group), channel)
                .await?;
        }
        Ok(())
    }

    async fn group_send(&self, payload: Payload, groups: &[&str]) -> Result<(), LayerError> {
        if groups.is_empty() {
            return Ok(());
        }
        let request = GroupSendRequest {
            groups: groups.iter().map(|g| g.to_string()).collect(),
            payload,
        };
        self.group_sends
            .send(request)
            .await
            .map_err(|_| LayerError::QueueClosed)
    }

    async fn send(&self, payload: Payload, channels: &[&str]) -> Result<(), LayerError> {
        for channel in channels {
            let envelope = Envelope::to_channels(payload.clone(), vec![channel.to_string()]);
            self.shared.route(owner_prefix(channel), envelope).await?;
        }
        Ok(())
    }

    async fn get_channels(&self, group: &str) -> Result<Vec<String>, LayerError> {
        Ok(self
            .shared
            .store
            .set_members(&self.shared.group_key(group))
            .await?)
    }

    fn new_channel(&self, hint: &str) -> String {
        let local = if hint.is_empty() {
            random_id(RANDOM_ID_LEN)
        } else {
            hint.to_string()
        };
        format!("{}{}{}", self.shared.prefix, CHANNEL_DELIMITER, local)
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), LayerError> {
        let requests: RequestQueue = match self.pending.lock().take() {
            Some(receiver) => Arc::new(AsyncMutex::new(receiver)),
            None => return Err(LayerError::AlreadyRunning),
        };

        let senders = {
            let shared = self.shared.clone();
            let token = cancel.clone();
            WorkerPool::spawn(
                "group_send",
                self.send_workers,
                self.restart.clone(),
                cancel.clone(),
                move |_| shared.clone().send_worker(requests.clone(), token.clone()),
            )
        };

        let receivers = {
            let shared = self.shared.clone();
            let token = cancel.clone();
            WorkerPool::spawn(
                "inbox_receive",
                self.receive_workers,
                self.restart.clone(),
                cancel,
                move |_| shared.clone().receive_worker(token.clone()),
            )
        };

        self.pools.lock().extend([senders, receivers]);
        tracing::info!(prefix = %self.shared.prefix, "Distributed channel layer running");
        Ok(())
    }

    async fn store_health(&self) -> Option<StoreHealth> {
        Some(self.shared.store.health().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::store::MemoryStore;
    use serde_json::json;

    fn test_config(prefix: &str) -> LayerConfig {
        LayerConfig {
            process_prefix: Some(prefix.to_string()),
            send_workers: 2,
            receive_workers: 2,
            pop_timeout_seconds: 1,
            restart_delay_ms: 10,
            ..LayerConfig::default()
        }
    }

    fn create_layer(
        store: Arc<MemoryStore>,
        prefix: &str,
    ) -> (DistributedLayer, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(64);
        let layer = DistributedLayer::new(store, &test_config(prefix), tx).unwrap();
        (layer, rx)
    }

    #[test]
    fn test_prefix_validation() {
        let store: Arc<dyn LayerStore> = Arc::new(MemoryStore::new());
        let (tx, _rx) = mpsc::channel(1);

        let bad = LayerConfig {
            process_prefix: Some("a!b".to_string()),
            ..LayerConfig::default()
        };
        assert!(matches!(
            DistributedLayer::new(store.clone(), &bad, tx.clone()),
            Err(LayerError::Config(_))
        ));

        let empty = LayerConfig {
            process_prefix: Some(String::new()),
            ..LayerConfig::default()
        };
        assert!(DistributedLayer::new(store.clone(), &empty, tx.clone()).is_err());

        let random = DistributedLayer::new(store, &LayerConfig::default(), tx).unwrap();
        assert_eq!(random.prefix().len(), RANDOM_ID_LEN);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let store: Arc<dyn LayerStore> = Arc::new(MemoryStore::new());
        let (tx, _rx) = mpsc::channel(1);
        let config = LayerConfig {
            send_workers: 0,
            ..LayerConfig::default()
        };
        assert!(matches!(
            DistributedLayer::new(store, &config, tx),
            Err(LayerError::Config(_))
        ));
    }

    #[test]
    fn test_zero_group_expiry_rejected() {
        let store: Arc<dyn LayerStore> = Arc::new(MemoryStore::new());
        let (tx, _rx) = mpsc::channel(1);
        let config = LayerConfig {
            group_expiry_seconds: 0,
            ..test_config("node1")
        };
        assert!(matches!(
            DistributedLayer::new(store, &config, tx),
            Err(LayerError::Config(_))
        ));
    }

    #[test]
    fn test_zero_restart_delay_rejected() {
        let store: Arc<dyn LayerStore> = Arc::new(MemoryStore::new());
        let (tx, _rx) = mpsc::channel(1);
        let config = LayerConfig {
            restart_delay_ms: 0,
            ..test_config("node1")
        };
        assert!(matches!(
            DistributedLayer::new(store, &config, tx),
            Err(LayerError::Config(_))
        ));
    }

    #[test]
    fn test_new_channel_embeds_prefix() {
        let (layer, _rx) = create_layer(Arc::new(MemoryStore::new()), "node1");
        assert_eq!(layer.new_channel("alice"), "node1!alice");

        let minted = layer.new_channel("");
        assert_eq!(owner_prefix(&minted), "node1");
        assert_eq!(minted.len(), "node1!".len() + RANDOM_ID_LEN);
    }

    #[tokio::test]
    async fn test_membership_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let (layer, _rx) = create_layer(store, "node1");

        layer.group_add("node1!a", &["g"]).await.unwrap();
        layer.group_add("node1!a", &["g"]).await.unwrap();
        layer.group_add("node2!b", &["g"]).await.unwrap();

        let mut members = layer.get_channels("g").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["node1!a", "node2!b"]);

        layer.group_discard("node1!a", &["g"]).await.unwrap();
        layer.group_discard("node1!zzz", &["g"]).await.unwrap();
        assert_eq!(layer.get_channels("g").await.unwrap(), vec!["node2!b"]);
    }

    #[tokio::test]
    async fn test_send_to_own_channel_takes_fast_path() {
        let store = Arc::new(MemoryStore::new());
        let (layer, mut rx) = create_layer(store.clone(), "node1");

        layer.send(json!("hi").into(), &["node1!a"]).await.unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.channels, vec!["node1!a"]);
        assert!(!envelope.payload.is_raw());
        assert_eq!(store.list_pushes(), 0);
        assert_eq!(store.operations(), 0);
    }

    #[tokio::test]
    async fn test_send_to_foreign_channel_is_relayed() {
        let store = Arc::new(MemoryStore::new());
        let (layer, mut rx) = create_layer(store.clone(), "node1");

        layer.send(json!("hi").into(), &["node2!b"]).await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(store.list_pushes(), 1);
        assert_eq!(store.list_len("channels:inbox:node2"), 1);
    }

    #[tokio::test]
    async fn test_override_relays_own_channels() {
        let store = Arc::new(MemoryStore::new());
        let (layer, _rx) = create_layer(store.clone(), "node1");
        layer.set_must_send_remote(true);
        assert!(layer.must_send_remote());

        layer.send(json!("hi").into(), &["node1!a"]).await.unwrap();
        assert_eq!(store.list_len("channels:inbox:node1"), 1);
    }

    #[tokio::test]
    async fn test_store_health_is_reported() {
        let (layer, _rx) = create_layer(Arc::new(MemoryStore::new()), "node1");
        let health = layer.store_health().await.unwrap();
        assert_eq!(health.store, "memory");
        assert!(health.healthy);
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let (layer, _rx) = create_layer(Arc::new(MemoryStore::new()), "node1");
        let cancel = CancellationToken::new();

        layer.run(cancel.clone()).await.unwrap();
        assert!(matches!(
            layer.run(cancel.clone()).await,
            Err(LayerError::AlreadyRunning)
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), layer.join())
            .await
            .expect("workers should stop on cancel");
    }

    #[tokio::test]
    async fn test_receive_worker_delivers_relayed_envelope() {
        let store = Arc::new(MemoryStore::new());
        let (layer, mut rx) = create_layer(store.clone(), "node1");
        layer.set_must_send_remote(true);

        let cancel = CancellationToken::new();
        layer.run(cancel.clone()).await.unwrap();

        layer.send(json!({"n": 1}).into(), &["node1!a"]).await.unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(envelope.payload.is_raw());
        assert_eq!(envelope.channels, vec!["node1!a"]);
        assert_eq!(
            envelope.payload.decode::<serde_json::Value>().unwrap(),
            json!({"n": 1})
        );

        cancel.cancel();
        layer.join().await;
    }

    #[tokio::test]
    async fn test_undecodable_inbox_record_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let (layer, mut rx) = create_layer(store.clone(), "node1");
        let cancel = CancellationToken::new();
        layer.run(cancel.clone()).await.unwrap();

        store
            .list_push("channels:inbox:node1", b"garbage".to_vec())
            .await
            .unwrap();
        layer.set_must_send_remote(true);
        layer.send(json!("ok").into(), &["node1!a"]).await.unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.payload.decode::<String>().unwrap(), "ok");
        assert_eq!(layer.worker_restarts(), 0);

        cancel.cancel();
        layer.join().await;
    }
}
