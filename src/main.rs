use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ws_channels::config::Settings;
use ws_channels::connection_manager::{
    ConnectRequest, Connection, ConnectionHandler, ConnectionManager, Origin,
};
use ws_channels::metrics::encode_metrics;
use ws_channels::websocket::{router, Frame, Upgrade};
use ws_channels::AppError;

/// Group every chat connection joins
const ROOM: &str = "all";

/// Chat relay: frames read from any socket are broadcast to the room
struct ChatHandler;

#[async_trait]
impl ConnectionHandler for ChatHandler {
    async fn on_connect(&self, request: ConnectRequest, upgrade: Upgrade) -> Response {
        let name = request.query_param("name").unwrap_or_default();
        let accepted = upgrade.accept(&name);

        if let Err(e) = accepted.group_add(&[ROOM]).await {
            tracing::error!(channel = %accepted.channel(), error = %e, "Failed to join room");
            return (StatusCode::SERVICE_UNAVAILABLE, "Chat room unavailable").into_response();
        }

        tracing::info!(channel = %accepted.channel(), "Joined room");
        accepted.into_response()
    }

    async fn on_disconnect(&self, code: u16, _reason: &str, conn: &Arc<Connection>) {
        if let Err(e) = conn.group_discard(&[ROOM]).await {
            tracing::warn!(channel = %conn.channel(), error = %e, "Failed to leave room");
        }
        tracing::info!(channel = %conn.channel(), code = code, "Left room");
    }

    async fn on_message(&self, frame: Frame, origin: Origin, conn: &Arc<Connection>) {
        match origin {
            Origin::Local => {
                if let Err(e) = conn.group_send(&frame, &[ROOM]).await {
                    tracing::warn!(channel = %conn.channel(), error = %e, "Broadcast failed");
                }
            }
            Origin::Server => {
                // Runs on the dispatch task; never wait on one slow client
                if let Err(e) = conn.try_send(frame) {
                    tracing::debug!(channel = %conn.channel(), error = %e, "Dropping delivery");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!(backend = ?settings.layer.backend, "Configuration loaded");

    let cancel = CancellationToken::new();

    // Build the channel layer and connection manager
    let manager = ConnectionManager::from_settings(&settings, Arc::new(ChatHandler), cancel.clone())?;
    let dispatcher = manager.run().await?;

    // A dead dispatch task takes the server down with it
    let dispatch_failed = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match dispatcher.await {
                Err(e) if e.is_panic() => {
                    tracing::error!("Dispatch task panicked, shutting down");
                    cancel.cancel();
                    true
                }
                _ => false,
            }
        })
    };

    let app = router(manager).route("/metrics", get(metrics_handler));

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(cancel.clone()))
        .await?;

    cancel.cancel();
    if dispatch_failed.await.unwrap_or(false) {
        anyhow::bail!("dispatch task panicked");
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn metrics_handler() -> std::result::Result<String, AppError> {
    Ok(encode_metrics()?)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    // LOG_FORMAT=json for structured output
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal_handler(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
        _ = cancel.cancelled() => {}
    }

    // Stop connection pumps and layer workers
    cancel.cancel();
}
