//! WebSocket endpoint integration tests
//!
//! A real server is bound on localhost and driven with a hand-written
//! upgrade request, so the `on_connect` hook runs exactly as it does behind
//! axum in production.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ws_channels::config::WebSocketConfig;
use ws_channels::connection_manager::{
    ConnectRequest, Connection, ConnectionHandler, ConnectionManager,
};
use ws_channels::layer::LocalLayer;
use ws_channels::websocket::{router, Frame, Upgrade};

const WAIT: Duration = Duration::from_secs(2);
const LOBBY: &str = "lobby";

/// Joins every accepted connection to the lobby; rejects the name `blocked`
#[derive(Default)]
struct LobbyHandler {
    connects: Mutex<Vec<String>>,
    disconnects: Mutex<Vec<(String, u16)>>,
}

#[async_trait]
impl ConnectionHandler for LobbyHandler {
    async fn on_connect(&self, request: ConnectRequest, upgrade: Upgrade) -> Response {
        let name = request.query_param("name").unwrap_or_default();
        if name == "blocked" {
            return (StatusCode::FORBIDDEN, "blocked").into_response();
        }

        let accepted = upgrade.accept(&name);
        if let Err(e) = accepted.group_add(&[LOBBY]).await {
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
        self.connects.lock().push(accepted.channel().to_string());
        accepted.into_response()
    }

    async fn on_disconnect(&self, code: u16, _reason: &str, conn: &Arc<Connection>) {
        self.disconnects
            .lock()
            .push((conn.channel().to_string(), code));
    }
}

async fn serve(
    handler: Arc<LobbyHandler>,
    config: WebSocketConfig,
) -> (Arc<ConnectionManager>, SocketAddr, CancellationToken) {
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let manager = ConnectionManager::new(
        Arc::new(LocalLayer::new(tx)),
        rx,
        handler,
        config,
        cancel.clone(),
    );
    manager.run().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(manager.clone());
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });

    (manager, addr, cancel)
}

/// Send an upgrade request; returns the stream and the response status line.
async fn handshake(addr: SocketAddr, path: &str, origin: Option<&str>) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n",
        path, addr
    );
    if let Some(origin) = origin {
        request.push_str(&format!("Origin: {}\r\n", origin));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    // Read the response head one byte at a time so no frame bytes are consumed
    let mut head = Vec::new();
    tokio::time::timeout(WAIT, async {
        while !head.ends_with(b"\r\n\r\n") {
            head.push(stream.read_u8().await.unwrap());
        }
    })
    .await
    .expect("no handshake response");

    let head = String::from_utf8(head).unwrap();
    let status = head.lines().next().unwrap_or_default().to_string();
    (stream, status)
}

fn test_config() -> WebSocketConfig {
    WebSocketConfig {
        close_timeout_ms: 200,
        ..Default::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// Handshake Tests
// =============================================================================

mod handshake_tests {
    use super::*;

    #[tokio::test]
    async fn test_on_connect_joins_group_through_accepted() {
        let handler = Arc::new(LobbyHandler::default());
        let (manager, addr, _cancel) = serve(handler.clone(), test_config()).await;

        let (_stream, status) = handshake(addr, "/ws?name=alice", None).await;
        assert!(status.contains("101"), "unexpected status: {}", status);

        assert_eq!(manager.get_channels(LOBBY).await.unwrap(), vec!["alice"]);
        assert_eq!(handler.connects.lock().clone(), vec!["alice"]);
        eventually(|| manager.connection("alice").is_some()).await;
    }

    #[tokio::test]
    async fn test_deliveries_reach_the_socket() {
        let handler = Arc::new(LobbyHandler::default());
        let (manager, addr, _cancel) = serve(handler, test_config()).await;

        let (mut stream, _) = handshake(addr, "/ws?name=bob", None).await;
        eventually(|| manager.connection("bob").is_some()).await;

        manager.group_send(&Frame::text("hi"), &[LOBBY]).await.unwrap();

        // Unmasked server text frame: FIN + opcode 1, length 2
        let mut frame = [0u8; 4];
        tokio::time::timeout(WAIT, stream.read_exact(&mut frame))
            .await
            .expect("frame not written in time")
            .unwrap();
        assert_eq!(frame, [0x81, 0x02, b'h', b'i']);
    }

    #[tokio::test]
    async fn test_dropped_socket_disconnects() {
        let handler = Arc::new(LobbyHandler::default());
        let (manager, addr, _cancel) = serve(handler.clone(), test_config()).await;

        let (stream, _) = handshake(addr, "/ws?name=carol", None).await;
        eventually(|| manager.connection_count() == 1).await;

        drop(stream);
        eventually(|| manager.connection_count() == 0).await;
        eventually(|| !handler.disconnects.lock().is_empty()).await;
        assert_eq!(handler.disconnects.lock()[0].0, "carol");
    }

    #[tokio::test]
    async fn test_on_connect_can_reject() {
        let handler = Arc::new(LobbyHandler::default());
        let (manager, addr, _cancel) = serve(handler.clone(), test_config()).await;

        let (_stream, status) = handshake(addr, "/ws?name=blocked", None).await;
        assert!(status.contains("403"), "unexpected status: {}", status);
        assert!(manager.get_channels(LOBBY).await.unwrap().is_empty());
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_disallowed_origin_never_reaches_hook() {
        let handler = Arc::new(LobbyHandler::default());
        let config = WebSocketConfig {
            allowed_origins: vec!["https://chat.test".to_string()],
            ..test_config()
        };
        let (_manager, addr, _cancel) = serve(handler.clone(), config).await;

        let (_stream, status) = handshake(addr, "/ws?name=dave", Some("https://evil.test")).await;
        assert!(status.contains("403"), "unexpected status: {}", status);
        assert!(handler.connects.lock().is_empty());

        let (_stream, status) = handshake(addr, "/ws?name=erin", Some("https://chat.test")).await;
        assert!(status.contains("101"), "unexpected status: {}", status);
    }
}
