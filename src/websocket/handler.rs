use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{future, SinkExt, StreamExt};
use parking_lot::Mutex;
use tower_http::trace::TraceLayer;

use crate::config::WebSocketConfig;
use crate::connection_manager::{ConnectRequest, ConnectionError, ConnectionManager};
use crate::layer::LayerError;

use super::health::health;
use super::message::{close_code, Frame, Inbound, Outbound};

/// Build the WebSocket router: `/ws` upgrades and hands the request to the
/// manager's `on_connect` hook; `/health` reports layer and store health.
pub fn router(manager: Arc<ConnectionManager>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

/// WebSocket upgrade handler
#[tracing::instrument(name = "ws.upgrade", skip_all, fields(path = %uri.path()))]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(manager): State<Arc<ConnectionManager>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let config = manager.config();

    if !origin_allowed(config, &headers) {
        tracing::warn!(origin = ?headers.get(header::ORIGIN), "WebSocket origin rejected");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let mut ws = ws
        .read_buffer_size(config.read_buffer_size)
        .write_buffer_size(config.write_buffer_size);
    if let Some(max) = config.max_message_size {
        ws = ws.max_message_size(max);
    }

    let handler = manager.handler().clone();
    let upgrade = Upgrade { ws, manager };
    handler
        .on_connect(ConnectRequest { uri, headers }, upgrade)
        .await
}

/// Requests without an `Origin` header (non-browser clients) are allowed.
fn origin_allowed(config: &WebSocketConfig, headers: &HeaderMap) -> bool {
    if config.allowed_origins.is_empty() {
        return true;
    }
    match headers.get(header::ORIGIN) {
        None => true,
        Some(origin) => origin.to_str().is_ok_and(|origin| {
            config
                .allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
        }),
    }
}

/// A pending upgrade handed to `on_connect`
pub struct Upgrade {
    ws: WebSocketUpgrade,
    manager: Arc<ConnectionManager>,
}

impl Upgrade {
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Mint a channel (using `hint` as its local part when non-empty) and
    /// upgrade. The connection is registered once the handshake completes.
    pub fn accept(self, hint: &str) -> Accepted {
        let channel = self.manager.mint_channel(hint);

        let manager = self.manager.clone();
        let attach_channel = channel.clone();
        let response = self
            .ws
            .on_failed_upgrade(|e| tracing::warn!(error = %e, "WebSocket upgrade failed"))
            .on_upgrade(move |socket| async move {
                attach_socket(&manager, attach_channel, socket);
            });

        Accepted {
            channel,
            response: Mutex::new(response),
            manager: self.manager,
        }
    }
}

/// An accepted upgrade. Return it from `on_connect` to complete the handshake.
pub struct Accepted {
    channel: String,
    /// `Response` is not `Sync`; the lock lets `&Accepted` cross an `.await`
    response: Mutex<Response>,
    manager: Arc<ConnectionManager>,
}

impl Accepted {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn group_add(&self, groups: &[&str]) -> Result<(), LayerError> {
        self.manager.group_add(&self.channel, groups).await
    }

    pub async fn group_discard(&self, groups: &[&str]) -> Result<(), LayerError> {
        self.manager.group_discard(&self.channel, groups).await
    }
}

impl IntoResponse for Accepted {
    fn into_response(self) -> Response {
        self.response.into_inner()
    }
}

/// Split an upgraded socket into manager transports
fn attach_socket(manager: &Arc<ConnectionManager>, channel: String, socket: WebSocket) {
    let (sink, stream) = socket.split();

    let reader = stream.filter_map(|message| future::ready(inbound(message)));
    let writer = sink
        .with(|out: Outbound| future::ready(Ok::<_, axum::Error>(outbound(out))))
        .sink_map_err(|e| ConnectionError::Protocol(e.to_string()));

    manager.attach(channel, reader, writer);
}

/// Control frames are answered by the protocol library and skipped here.
fn inbound(message: Result<Message, axum::Error>) -> Option<Result<Inbound, ConnectionError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(Inbound::Frame(Frame::Text(text.as_str().to_owned())))),
        Ok(Message::Binary(bytes)) => Some(Ok(Inbound::Frame(Frame::Binary(bytes.to_vec())))),
        Ok(Message::Close(Some(frame))) => Some(Ok(Inbound::Close {
            code: frame.code,
            reason: frame.reason.as_str().to_owned(),
        })),
        Ok(Message::Close(None)) => Some(Ok(Inbound::Close {
            code: close_code::NO_STATUS,
            reason: String::new(),
        })),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Err(e) => Some(Err(ConnectionError::Protocol(e.to_string()))),
    }
}

fn outbound(out: Outbound) -> Message {
    match out {
        Outbound::Frame(Frame::Text(text)) => Message::Text(text.into()),
        Outbound::Frame(Frame::Binary(bytes)) => Message::Binary(bytes.into()),
        Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config_with_origins(origins: &[&str]) -> WebSocketConfig {
        WebSocketConfig {
            allowed_origins: origins.iter().map(|o| o.to_string()).collect(),
            ..Default::default()
        }
    }

    fn headers_with_origin(origin: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_str(origin).unwrap());
        headers
    }

    #[test]
    fn test_accepted_can_be_held_across_await() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Accepted>();
    }

    #[test]
    fn test_origin_check() {
        let open = config_with_origins(&[]);
        assert!(origin_allowed(&open, &headers_with_origin("https://evil.test")));

        let strict = config_with_origins(&["https://chat.example.com"]);
        assert!(origin_allowed(&strict, &headers_with_origin("https://chat.example.com")));
        assert!(!origin_allowed(&strict, &headers_with_origin("https://evil.test")));
        assert!(origin_allowed(&strict, &HeaderMap::new()));

        let wildcard = config_with_origins(&["*"]);
        assert!(origin_allowed(&wildcard, &headers_with_origin("https://any.test")));
    }

    #[test]
    fn test_inbound_conversion() {
        assert_eq!(
            inbound(Ok(Message::Text("hi".into()))).unwrap().unwrap(),
            Inbound::Frame(Frame::text("hi"))
        );
        assert_eq!(
            inbound(Ok(Message::Binary(vec![1u8, 2].into()))).unwrap().unwrap(),
            Inbound::Frame(Frame::Binary(vec![1, 2]))
        );
        assert_eq!(
            inbound(Ok(Message::Close(None))).unwrap().unwrap(),
            Inbound::Close {
                code: close_code::NO_STATUS,
                reason: String::new()
            }
        );
        assert!(inbound(Ok(Message::Ping(Vec::new().into()))).is_none());
    }

    #[test]
    fn test_outbound_conversion() {
        match outbound(Outbound::Close {
            code: close_code::GOING_AWAY,
            reason: "bye".to_string(),
        }) {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, close_code::GOING_AWAY);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("unexpected message: {:?}", other),
        }

        assert!(matches!(
            outbound(Outbound::Frame(Frame::text("x"))),
            Message::Text(_)
        ));
    }
}
