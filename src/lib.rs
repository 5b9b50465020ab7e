// Shared infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod redis;
pub mod supervisor;

// Channel layers (membership and delivery)
pub mod layer;

// Connection handling
pub mod connection_manager;
pub mod websocket;

pub use connection_manager::{Connection, ConnectionHandler, ConnectionManager, Origin};
pub use error::{AppError, Result};
pub use layer::{ChannelLayer, Envelope, LayerError, Payload};
pub use websocket::{router, Frame};
