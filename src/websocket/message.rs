use serde::{Deserialize, Serialize};

/// One WebSocket data frame.
///
/// Frames are what applications send through the layer: they ride inside a
/// [`Payload`](crate::layer::Payload) and are decoded again on dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Frame {
    Text(String),
    /// Base64 encoded on the wire
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Item read from a connection transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    /// The peer sent a close frame
    Close { code: u16, reason: String },
}

/// Item written to a connection transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Frame),
    Close { code: u16, reason: String },
}

/// Close codes used by the connection state machine (RFC 6455 section 7.4.1)
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL: u16 = 1002;
    /// No status code was present in the peer's close frame
    pub const NO_STATUS: u16 = 1005;
    /// The transport ended without a close frame
    pub const ABNORMAL: u16 = 1006;
}
