use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub layer: LayerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Which channel layer backs group membership and delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerBackendKind {
    /// Single-process, in-memory membership
    Memory,
    /// Multi-process membership in Redis
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayerConfig {
    #[serde(default = "default_backend")]
    pub backend: LayerBackendKind,
    /// Group set TTL, refreshed on every add
    #[serde(default = "default_group_expiry")]
    pub group_expiry_seconds: u64,
    /// Workers resolving queued group sends
    #[serde(default = "default_workers")]
    pub send_workers: usize,
    /// Workers popping this process's inbox
    #[serde(default = "default_workers")]
    pub receive_workers: usize,
    #[serde(default = "default_queue_buffer")]
    pub group_send_buffer: usize,
    /// Capacity of the queue between the layer and the connection manager
    #[serde(default = "default_queue_buffer")]
    pub delivery_buffer: usize,
    #[serde(default = "default_pop_timeout")]
    pub pop_timeout_seconds: u64,
    /// Delay before a failed worker is replaced
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,
    /// Relay through the store even when the channel is owned locally
    #[serde(default)]
    pub must_send_remote: bool,
    /// Fixed process prefix (random when absent)
    #[serde(default)]
    pub process_prefix: Option<String>,
    #[serde(default = "default_key_namespace")]
    pub key_namespace: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Max connections checked out at once (0 = unbounded)
    #[serde(default)]
    pub max_active: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// Wait for a free connection instead of failing when `max_active` is reached
    #[serde(default = "default_true")]
    pub wait: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,
    #[serde(default)]
    pub max_message_size: Option<usize>,
    /// Frames queued per connection before senders wait
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
    /// Accepted `Origin` headers (empty = any)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7777
}

fn default_backend() -> LayerBackendKind {
    LayerBackendKind::Memory
}

fn default_group_expiry() -> u64 {
    86_400 // 1 day
}

fn default_workers() -> usize {
    5
}

fn default_queue_buffer() -> usize {
    500
}

fn default_pop_timeout() -> u64 {
    5
}

fn default_restart_delay() -> u64 {
    10_000
}

fn default_key_namespace() -> String {
    "channels".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_max_idle() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    1024
}

fn default_outbound_buffer() -> usize {
    1000
}

fn default_close_timeout() -> u64 {
    3_000
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 7777)?
            .set_default("layer.backend", "memory")?
            .set_default("redis.url", "redis://localhost:6379")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // LAYER__BACKEND, REDIS__URL, WEBSOCKET__OUTBOUND_BUFFER, ...
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("websocket.allowed_origins"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl LayerConfig {
    pub fn group_expiry(&self) -> Duration {
        Duration::from_secs(self.group_expiry_seconds)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_seconds)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl RedisConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

impl WebSocketConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            group_expiry_seconds: default_group_expiry(),
            send_workers: default_workers(),
            receive_workers: default_workers(),
            group_send_buffer: default_queue_buffer(),
            delivery_buffer: default_queue_buffer(),
            pop_timeout_seconds: default_pop_timeout(),
            restart_delay_ms: default_restart_delay(),
            must_send_remote: false,
            process_prefix: None,
            key_namespace: default_key_namespace(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            max_active: 0,
            max_idle: default_max_idle(),
            idle_timeout_seconds: default_idle_timeout(),
            wait: true,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_buffer_size(),
            write_buffer_size: default_buffer_size(),
            max_message_size: None,
            outbound_buffer: default_outbound_buffer(),
            close_timeout_ms: default_close_timeout(),
            allowed_origins: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 7777);

        let layer = LayerConfig::default();
        assert_eq!(layer.backend, LayerBackendKind::Memory);
        assert_eq!(layer.group_expiry(), Duration::from_secs(86_400));
        assert_eq!(layer.send_workers, 5);
        assert_eq!(layer.receive_workers, 5);
        assert_eq!(layer.pop_timeout(), Duration::from_secs(5));
        assert_eq!(layer.restart_delay(), Duration::from_secs(10));
        assert!(!layer.must_send_remote);
    }

    #[test]
    fn test_backend_kind_deserializes_lowercase() {
        let kind: LayerBackendKind = serde_json::from_str("\"redis\"").unwrap();
        assert_eq!(kind, LayerBackendKind::Redis);
    }

    #[test]
    fn test_partial_layer_config_uses_defaults() {
        let layer: LayerConfig =
            serde_json::from_str(r#"{"backend":"redis","send_workers":2}"#).unwrap();
        assert_eq!(layer.backend, LayerBackendKind::Redis);
        assert_eq!(layer.send_workers, 2);
        assert_eq!(layer.receive_workers, 5);
        assert_eq!(layer.key_namespace, "channels");
    }
}
