//! Connection manager: owns this process's live connections and drains the
//! channel layer's delivery queue into them.

mod connection;
mod handler;
mod registry;

pub use connection::{Connection, ConnectionError, ConnectionState};
pub use handler::{ConnectRequest, ConnectionHandler, DefaultHandler, Origin};
pub use registry::ConnectionRegistry;

use std::sync::Arc;

use futures::{Sink, Stream};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Settings, WebSocketConfig};
use crate::layer::{create_layer, ChannelLayer, Envelope, LayerError, Payload};
use crate::metrics::DispatchMetrics;
use crate::websocket::{close_code, Frame, Inbound, Outbound};

use connection::{read_pump, write_pump};

/// Owns live connections and routes layer deliveries to them
pub struct ConnectionManager {
    layer: Arc<dyn ChannelLayer>,
    registry: ConnectionRegistry,
    handler: Arc<dyn ConnectionHandler>,
    config: WebSocketConfig,
    deliveries: Mutex<Option<mpsc::Receiver<Envelope>>>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// `deliveries` must be the receiving end of the queue `layer` was built with.
    pub fn new(
        layer: Arc<dyn ChannelLayer>,
        deliveries: mpsc::Receiver<Envelope>,
        handler: Arc<dyn ConnectionHandler>,
        config: WebSocketConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            layer,
            registry: ConnectionRegistry::new(),
            handler,
            config,
            deliveries: Mutex::new(Some(deliveries)),
            cancel,
        })
    }

    /// Build the configured layer and a manager draining it.
    pub fn from_settings(
        settings: &Settings,
        handler: Arc<dyn ConnectionHandler>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, LayerError> {
        if settings.layer.delivery_buffer == 0 {
            return Err(LayerError::Config("delivery buffer must be positive".into()));
        }
        let (tx, rx) = mpsc::channel(settings.layer.delivery_buffer);
        let layer = create_layer(&settings.layer, &settings.redis, tx)?;
        Ok(Self::new(layer, rx, handler, settings.websocket.clone(), cancel))
    }

    /// Start the layer's background work and the dispatch task.
    ///
    /// The returned handle completes when the manager's token is cancelled,
    /// or with a panic if a group-addressed envelope reaches dispatch.
    pub async fn run(self: &Arc<Self>) -> Result<JoinHandle<()>, LayerError> {
        let deliveries = self
            .deliveries
            .lock()
            .take()
            .ok_or(LayerError::AlreadyRunning)?;

        self.layer.run(self.cancel.child_token()).await?;

        let manager = self.clone();
        let dispatcher = tokio::spawn(async move { manager.dispatch_loop(deliveries).await });

        tracing::info!(backend = ?self.layer.backend_type(), "Connection manager running");
        Ok(dispatcher)
    }

    async fn dispatch_loop(&self, mut deliveries: mpsc::Receiver<Envelope>) {
        loop {
            let envelope = tokio::select! {
                _ = self.cancel.cancelled() => break,
                envelope = deliveries.recv() => envelope,
            };
            match envelope {
                Some(envelope) => self.dispatch(envelope).await,
                None => break,
            }
        }
        tracing::debug!("Dispatch loop stopped");
    }

    /// Hand one envelope to the `on_message` hook of each addressed local
    /// connection. Channels without a local connection are skipped.
    ///
    /// Hooks run one after another on the dispatch task; a hook that waits on
    /// a full outbound queue holds up every later delivery.
    ///
    /// # Panics
    ///
    /// Envelopes addressed only to groups are not supported.
    pub async fn dispatch(&self, envelope: Envelope) {
        DispatchMetrics::record_dispatched();

        if envelope.channels.is_empty() {
            if !envelope.groups.is_empty() {
                unimplemented!("dispatch of group-addressed envelopes ({:?})", envelope.groups);
            }
            return;
        }

        let frame: Frame = match envelope.payload.decode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(channels = ?envelope.channels, error = %e, "Dropping envelope with undecodable payload");
                return;
            }
        };

        for channel in &envelope.channels {
            match self.registry.get(channel) {
                Some(conn) => {
                    self.handler
                        .on_message(frame.clone(), Origin::Server, &conn)
                        .await;
                }
                None => {
                    DispatchMetrics::record_miss();
                    tracing::debug!(channel = %channel, "No local connection for delivery");
                }
            }
        }
    }

    /// Register a connection over `reader`/`writer` and start its pumps.
    pub fn attach<R, W>(self: &Arc<Self>, channel: String, reader: R, writer: W) -> Arc<Connection>
    where
        R: Stream<Item = Result<Inbound, ConnectionError>> + Send + 'static,
        W: Sink<Outbound, Error = ConnectionError> + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let conn = Arc::new(Connection::new(
            channel,
            self.layer.clone(),
            outbound_tx,
            self.cancel.child_token(),
            self.config.close_timeout(),
        ));

        if let Some(previous) = self.registry.insert(conn.clone()) {
            tracing::warn!(channel = %conn.channel(), "Channel reattached, closing previous connection");
            previous.close(close_code::NORMAL, "replaced");
        }

        tracing::info!(channel = %conn.channel(), "Connection established");

        let manager = self.clone();
        let task_conn = conn.clone();
        tokio::spawn(async move {
            let handler = manager.handler.clone();
            tokio::join!(
                read_pump(task_conn.clone(), reader, handler),
                write_pump(task_conn.clone(), outbound_rx, writer),
            );
            manager.disconnected(&task_conn).await;
        });

        conn
    }

    async fn disconnected(&self, conn: &Arc<Connection>) {
        let Some((code, reason)) = conn.finish() else {
            return;
        };
        self.registry.remove(conn);

        tracing::info!(
            channel = %conn.channel(),
            code = code,
            reason = %reason,
            duration_secs = (chrono::Utc::now() - conn.connected_at()).num_seconds(),
            "Connection closed"
        );

        self.handler.on_disconnect(code, &reason, conn).await;
    }

    /// Mint a channel id through the layer
    pub fn mint_channel(&self, hint: &str) -> String {
        self.layer.new_channel(hint)
    }

    pub async fn send(&self, frame: &Frame, channels: &[&str]) -> Result<(), LayerError> {
        self.layer.send(Payload::encode(frame)?, channels).await
    }

    pub async fn group_send(&self, frame: &Frame, groups: &[&str]) -> Result<(), LayerError> {
        self.layer.group_send(Payload::encode(frame)?, groups).await
    }

    pub async fn group_add(&self, channel: &str, groups: &[&str]) -> Result<(), LayerError> {
        self.layer.group_add(channel, groups).await
    }

    pub async fn group_discard(&self, channel: &str, groups: &[&str]) -> Result<(), LayerError> {
        self.layer.group_discard(channel, groups).await
    }

    pub async fn get_channels(&self, group: &str) -> Result<Vec<String>, LayerError> {
        self.layer.get_channels(group).await
    }

    pub fn connection(&self, channel: &str) -> Option<Arc<Connection>> {
        self.registry.get(channel)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn layer(&self) -> &Arc<dyn ChannelLayer> {
        &self.layer
    }

    pub fn handler(&self) -> &Arc<dyn ConnectionHandler> {
        &self.handler
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
