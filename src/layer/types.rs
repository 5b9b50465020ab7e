//! Channel layer types shared by both backends

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;

use super::store::StoreError;

/// Separates the owning process prefix from the local part of a channel
pub const CHANNEL_DELIMITER: char = '!';

/// Length of generated process prefixes and channel suffixes
pub const RANDOM_ID_LEN: usize = 8;

/// Owning process prefix of a channel. A channel without the delimiter is
/// returned unchanged.
pub fn owner_prefix(channel: &str) -> &str {
    channel
        .split_once(CHANNEL_DELIMITER)
        .map(|(prefix, _)| prefix)
        .unwrap_or(channel)
}

/// Random alphanumeric id; never contains [`CHANNEL_DELIMITER`].
pub fn random_id(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Message payload carried by an [`Envelope`].
///
/// Payloads created in this process stay typed; payloads relayed through the
/// store stay raw JSON until a consumer decodes them.
#[derive(Debug, Clone)]
pub enum Payload {
    Value(serde_json::Value),
    Raw(Box<RawValue>),
}

impl Payload {
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Self::Value(value) => T::deserialize(value),
            Self::Raw(raw) => serde_json::from_str(raw.get()),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(value) => value.serialize(serializer),
            Self::Raw(raw) => raw.serialize(serializer),
        }
    }
}

/// A payload plus its routing targets, handed from the layer to the
/// connection manager.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "message")]
    pub payload: Payload,
    pub channels: Vec<String>,
    /// Reserved; group-addressed envelopes are not dispatched
    pub groups: Vec<String>,
}

/// Relay record as stored in a process inbox
#[derive(Deserialize)]
struct WireEnvelope {
    message: Box<RawValue>,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default)]
    groups: Vec<String>,
}

impl Envelope {
    pub fn to_channels(payload: Payload, channels: Vec<String>) -> Self {
        Self {
            payload,
            channels,
            groups: Vec::new(),
        }
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a relay record; the payload is kept raw.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;
        Ok(Self {
            payload: Payload::Raw(wire.message),
            channels: wire.channels,
            groups: wire.groups,
        })
    }
}

/// Error type for channel layer operations
#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    /// Invalid or missing configuration; never retried
    #[error("Layer configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The connection manager stopped consuming deliveries
    #[error("Delivery queue closed")]
    QueueClosed,

    #[error("Layer is already running")]
    AlreadyRunning,
}

/// Backend type for a channel layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerBackend {
    /// Single-process, in-memory membership
    Local,
    /// Store-backed membership shared by a cluster
    Distributed,
}
