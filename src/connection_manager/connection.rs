//! A single live connection and its read/write pumps.
//!
//! State machine: `Open -> Closing -> Closed`. Only the connection's own
//! lifecycle task moves it to `Closed`; every other transition is a
//! compare-and-swap out of `Open`, so closing twice is a no-op.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::layer::{ChannelLayer, LayerError, Payload};
use crate::metrics::ConnectionMetrics;
use crate::websocket::{close_code, Frame, Inbound, Outbound};

use super::handler::{ConnectionHandler, Origin};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Error type for connection operations
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection is closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The outbound queue is at capacity
    #[error("Outbound queue is full")]
    Full,
}

/// A live connection bound to one channel
pub struct Connection {
    channel: String,
    state: AtomicU8,
    outbound: mpsc::Sender<Frame>,
    /// Close frame the writer should send, set by [`Connection::close`]
    close_request: Mutex<Option<(u16, String)>>,
    /// Status reported to `on_disconnect`
    close_status: Mutex<Option<(u16, String)>>,
    close_requested: Notify,
    cancel: CancellationToken,
    close_timeout: Duration,
    layer: Arc<dyn ChannelLayer>,
    connected_at: DateTime<Utc>,
}

impl Connection {
    pub(crate) fn new(
        channel: String,
        layer: Arc<dyn ChannelLayer>,
        outbound: mpsc::Sender<Frame>,
        cancel: CancellationToken,
        close_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            state: AtomicU8::new(ConnectionState::Open as u8),
            outbound,
            close_request: Mutex::new(None),
            close_status: Mutex::new(None),
            close_requested: Notify::new(),
            cancel,
            close_timeout,
            layer,
            connected_at: Utc::now(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queue a frame on this connection's outbound queue.
    pub async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ConnectionError::Closed),
            result = self.outbound.send(frame) => result.map_err(|_| ConnectionError::Closed),
        }
    }

    /// Queue a frame without waiting for queue space.
    pub fn try_send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::Full,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    /// Begin a graceful close: the writer sends a close frame, then waits for
    /// the peer's reply for at most the close timeout.
    pub fn close(&self, code: u16, reason: &str) {
        if self.begin_closing() {
            *self.close_request.lock() = Some((code, reason.to_string()));
            self.record_status(code, reason);
            self.close_requested.notify_one();
            ConnectionMetrics::record_closed("local");
            tracing::debug!(channel = %self.channel, code = code, "Connection closing");
        }
    }

    /// Tear down without a close handshake. Returns whether this call ended
    /// an open connection.
    fn abort(&self, code: u16, reason: &str) -> bool {
        let was_open = self.begin_closing();
        self.record_status(code, reason);
        self.cancel.cancel();
        was_open
    }

    fn begin_closing(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// First recorded status wins
    fn record_status(&self, code: u16, reason: &str) {
        let mut status = self.close_status.lock();
        if status.is_none() {
            *status = Some((code, reason.to_string()));
        }
    }

    /// Mark the connection closed. Returns the status to report, only on the
    /// first call.
    pub(crate) fn finish(&self) -> Option<(u16, String)> {
        let previous = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if ConnectionState::from(previous) == ConnectionState::Closed {
            return None;
        }
        self.cancel.cancel();
        let status = self
            .close_status
            .lock()
            .clone()
            .unwrap_or((close_code::ABNORMAL, String::new()));
        Some(status)
    }

    pub async fn group_add(&self, groups: &[&str]) -> Result<(), LayerError> {
        self.layer.group_add(&self.channel, groups).await
    }

    pub async fn group_discard(&self, groups: &[&str]) -> Result<(), LayerError> {
        self.layer.group_discard(&self.channel, groups).await
    }

    pub async fn group_send(&self, frame: &Frame, groups: &[&str]) -> Result<(), LayerError> {
        self.layer.group_send(Payload::encode(frame)?, groups).await
    }

    /// Send a frame to other channels through the layer
    pub async fn send_to(&self, frame: &Frame, channels: &[&str]) -> Result<(), LayerError> {
        self.layer.send(Payload::encode(frame)?, channels).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("channel", &self.channel)
            .field("state", &self.state())
            .finish()
    }
}

/// Read frames one at a time and hand them to the handler as local messages.
pub(crate) async fn read_pump<R>(
    conn: Arc<Connection>,
    reader: R,
    handler: Arc<dyn ConnectionHandler>,
) where
    R: Stream<Item = Result<Inbound, ConnectionError>> + Send + 'static,
{
    let mut reader = Box::pin(reader);

    loop {
        let item = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            item = reader.next() => item,
        };

        match item {
            Some(Ok(Inbound::Frame(frame))) => {
                ConnectionMetrics::record_frame_in();
                handler.on_message(frame, Origin::Local, &conn).await;
            }
            Some(Ok(Inbound::Close { code, reason })) => {
                tracing::debug!(channel = %conn.channel, code = code, "Peer closed connection");
                if conn.abort(code, &reason) {
                    ConnectionMetrics::record_closed("remote");
                }
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(channel = %conn.channel, error = %e, "Read failed, closing connection");
                conn.close(close_code::PROTOCOL, "protocol error");
                break;
            }
            None => {
                tracing::debug!(channel = %conn.channel, "Transport ended");
                if conn.abort(close_code::ABNORMAL, "") {
                    ConnectionMetrics::record_closed("remote");
                }
                break;
            }
        }
    }
}

/// Drain the outbound queue in order; send a close frame when asked to.
pub(crate) async fn write_pump<W>(conn: Arc<Connection>, mut outbound: mpsc::Receiver<Frame>, writer: W)
where
    W: Sink<Outbound, Error = ConnectionError> + Send + 'static,
{
    let mut writer = Box::pin(writer);

    loop {
        tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => return,
            _ = conn.close_requested.notified() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { return };
                if let Err(e) = writer.send(Outbound::Frame(frame)).await {
                    tracing::warn!(channel = %conn.channel, error = %e, "Write failed, closing connection");
                    if conn.abort(close_code::ABNORMAL, "write failed") {
                        ConnectionMetrics::record_closed("error");
                    }
                    return;
                }
                ConnectionMetrics::record_frame_out();
            }
        }
    }

    // Graceful close: send the close frame, then give the peer time to answer
    let request = conn.close_request.lock().take();
    if let Some((code, reason)) = request {
        let close = writer.send(Outbound::Close { code, reason });
        if tokio::time::timeout(conn.close_timeout, close).await.is_err() {
            tracing::debug!(channel = %conn.channel, "Close frame timed out");
        }
        let _ = tokio::time::timeout(conn.close_timeout, conn.cancel.cancelled()).await;
    }
    conn.cancel.cancel();
}
