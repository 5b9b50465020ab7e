//! Channel layers: group membership and message delivery
//!
//! Two backends implement [`ChannelLayer`]:
//! - [`LocalLayer`] keeps membership in process memory for single-process deployments
//! - [`DistributedLayer`] keeps membership in a shared store and relays
//!   deliveries between processes

mod distributed;
mod factory;
mod local;
pub mod store;
mod traits;
mod types;

pub use distributed::DistributedLayer;
pub use factory::create_layer;
pub use local::LocalLayer;
pub use store::{LayerStore, MemoryStore, RedisStore, StoreError, StoreHealth};
pub use traits::ChannelLayer;
pub use types::{
    owner_prefix, random_id, Envelope, LayerBackend, LayerError, Payload, CHANNEL_DELIMITER,
    RANDOM_ID_LEN,
};
