//! WebSocket transport: frame types and the axum upgrade path

mod handler;
mod health;
mod message;

pub use handler::{router, ws_handler, Accepted, Upgrade};
pub use health::{health, HealthReport};
pub use message::{close_code, Frame, Inbound, Outbound};
