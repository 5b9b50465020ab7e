mod settings;

pub use settings::{
    LayerBackendKind, LayerConfig, RedisConfig, ServerConfig, Settings, WebSocketConfig,
};
