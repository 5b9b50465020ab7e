//! Application hooks invoked by the connection manager

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Query;
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};

use crate::metrics::DispatchMetrics;
use crate::websocket::{Frame, Upgrade};

use super::connection::{Connection, ConnectionError};

/// Where a message handed to [`ConnectionHandler::on_message`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Read from the connection's own socket
    Local,
    /// Delivered through the channel layer
    Server,
}

/// The parts of the upgrade request visible to `on_connect`
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl ConnectRequest {
    /// Percent-decoded value of a query parameter, if present
    pub fn query_param(&self, name: &str) -> Option<String> {
        let Query(mut params) = Query::<HashMap<String, String>>::try_from_uri(&self.uri).ok()?;
        params.remove(name)
    }
}

/// Application logic plugged into the connection manager.
///
/// Every hook has a default, so an empty `impl ConnectionHandler for X {}`
/// accepts every connection and writes layer deliveries straight to the
/// target connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called for each upgrade request after the origin check. Call
    /// [`Upgrade::accept`] to mint a channel and upgrade; returning any other
    /// response rejects the connection.
    async fn on_connect(&self, _request: ConnectRequest, upgrade: Upgrade) -> Response {
        upgrade.accept("").into_response()
    }

    /// Called once after a connection reaches `Closed`. Group membership is
    /// left untouched.
    async fn on_disconnect(&self, _code: u16, _reason: &str, _conn: &Arc<Connection>) {}

    /// Called for every frame read from the socket (`Origin::Local`) and every
    /// delivery addressed to the connection's channel (`Origin::Server`).
    ///
    /// Server-origin calls run on the manager's single dispatch task, so
    /// waiting here delays deliveries to every other connection. The default
    /// drops a delivery when the connection's outbound queue is full.
    async fn on_message(&self, frame: Frame, origin: Origin, conn: &Arc<Connection>) {
        if origin == Origin::Server {
            match conn.try_send(frame) {
                Ok(()) => {}
                Err(ConnectionError::Full) => {
                    DispatchMetrics::record_dropped();
                    tracing::warn!(channel = %conn.channel(), "Outbound queue full, dropping delivery");
                }
                Err(e) => {
                    tracing::debug!(channel = %conn.channel(), error = %e, "Dropping delivery");
                }
            }
        }
    }
}

/// Handler with every hook left at its default
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl ConnectionHandler for DefaultHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        let request = ConnectRequest {
            uri: "/ws?name=alice&room=lobby&flag".parse().unwrap(),
            headers: HeaderMap::new(),
        };
        assert_eq!(request.query_param("name").as_deref(), Some("alice"));
        assert_eq!(request.query_param("room").as_deref(), Some("lobby"));
        assert_eq!(request.query_param("flag").as_deref(), Some(""));
        assert_eq!(request.query_param("missing"), None);

        let bare = ConnectRequest {
            uri: "/ws".parse().unwrap(),
            headers: HeaderMap::new(),
        };
        assert_eq!(bare.query_param("name"), None);
    }

    #[test]
    fn test_query_param_is_percent_decoded() {
        let request = ConnectRequest {
            uri: "/ws?name=bob%20x&room=a+b".parse().unwrap(),
            headers: HeaderMap::new(),
        };
        assert_eq!(request.query_param("name").as_deref(), Some("bob x"));
        assert_eq!(request.query_param("room").as_deref(), Some("a b"));
    }
}
