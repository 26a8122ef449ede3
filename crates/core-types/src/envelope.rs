// In crates/core-types/src/envelope.rs

//! The wire contract shared by the dashboard client and the server.
//!
//! Every frame is one JSON object:
//!
//! ```text
//! { "type": "<kind>", "data": { ... }, "timestamp": "<ISO-8601>", "correlation_id": "<string>" }
//! ```

use crate::types::{AccountUpdate, Heartbeat, PositionUpdate, PriceUpdate, SystemStatus};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The closed set of message types understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    AccountUpdate,
    PositionUpdate,
    PriceUpdate,
    SystemStatus,
    Heartbeat,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::AccountUpdate,
        MessageKind::PositionUpdate,
        MessageKind::PriceUpdate,
        MessageKind::SystemStatus,
        MessageKind::Heartbeat,
    ];

    /// The `type` tag used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccountUpdate => "account_update",
            Self::PositionUpdate => "position_update",
            Self::PriceUpdate => "price_update",
            Self::SystemStatus => "system_status",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownKind(s.to_string()))
    }
}

/// Client-generated token tying an outbound message to its effects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// A fresh random (v4 UUID) identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kind-specific body of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Account(AccountUpdate),
    Position(PositionUpdate),
    Price(PriceUpdate),
    Status(SystemStatus),
    Heartbeat(Heartbeat),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Account(_) => MessageKind::AccountUpdate,
            Self::Position(_) => MessageKind::PositionUpdate,
            Self::Price(_) => MessageKind::PriceUpdate,
            Self::Status(_) => MessageKind::SystemStatus,
            Self::Heartbeat(_) => MessageKind::Heartbeat,
        }
    }

    /// The store key of the entity this payload describes, if any.
    pub fn entity_key(&self) -> Option<&str> {
        match self {
            Self::Account(a) => Some(&a.account_id),
            Self::Position(p) => Some(&p.position_id),
            Self::Price(p) => Some(&p.symbol),
            Self::Status(s) => Some(&s.service),
            Self::Heartbeat(_) => None,
        }
    }

    fn decode(kind: MessageKind, data: Value) -> Result<Self> {
        let invalid = |source| Error::InvalidPayload {
            kind: kind.as_str(),
            source,
        };
        let payload = match kind {
            MessageKind::AccountUpdate => Self::Account(serde_json::from_value(data).map_err(invalid)?),
            MessageKind::PositionUpdate => Self::Position(serde_json::from_value(data).map_err(invalid)?),
            MessageKind::PriceUpdate => Self::Price(serde_json::from_value(data).map_err(invalid)?),
            MessageKind::SystemStatus => Self::Status(serde_json::from_value(data).map_err(invalid)?),
            MessageKind::Heartbeat => {
                // Servers send `{}`, `null`, or omit the body entirely.
                if data.is_null() {
                    Self::Heartbeat(Heartbeat::default())
                } else {
                    Self::Heartbeat(serde_json::from_value(data).map_err(invalid)?)
                }
            }
        };
        Ok(payload)
    }
}

/// A typed wire message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    payload: Payload,
    timestamp: DateTime<Utc>,
    correlation_id: CorrelationId,
}

/// Envelope fields as they appear on the wire, before the payload is typed.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(deserialize_with = "crate::timestamp::deserialize")]
    timestamp: DateTime<Utc>,
    correlation_id: CorrelationId,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    kind: MessageKind,
    data: &'a Payload,
    timestamp: &'a DateTime<Utc>,
    correlation_id: &'a CorrelationId,
}

impl MessageEnvelope {
    /// Wraps `payload` with the current time and a fresh correlation id.
    pub fn new(payload: Payload) -> Self {
        Self::with_timestamp(payload, Utc::now())
    }

    pub fn with_timestamp(payload: Payload, timestamp: DateTime<Utc>) -> Self {
        Self {
            payload,
            timestamp,
            correlation_id: CorrelationId::new(),
        }
    }

    pub fn from_parts(payload: Payload, timestamp: DateTime<Utc>, correlation_id: CorrelationId) -> Self {
        Self {
            payload,
            timestamp,
            correlation_id,
        }
    }

    /// An outbound keep-alive message.
    pub fn heartbeat() -> Self {
        Self::new(Payload::Heartbeat(Heartbeat::default()))
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Decodes a text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(Error::MalformedFrame)?;
        Self::from_value(value)
    }

    /// Decodes a binary frame carrying UTF-8 JSON.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_json(std::str::from_utf8(bytes)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        // Check the tag first so an unknown kind is reported as such rather than
        // as a generic shape error.
        if let Some(tag) = value.get("type").and_then(Value::as_str) {
            MessageKind::from_str(tag)?;
        }
        let raw: RawEnvelope = serde_json::from_value(value).map_err(Error::InvalidEnvelope)?;
        let kind = MessageKind::from_str(&raw.kind)?;
        let payload = Payload::decode(kind, raw.data)?;
        Ok(Self {
            payload,
            timestamp: raw.timestamp,
            correlation_id: raw.correlation_id,
        })
    }

    /// Encodes the envelope as a single text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::Encode)
    }

    fn wire(&self) -> WireEnvelope<'_> {
        WireEnvelope {
            kind: self.kind(),
            data: &self.payload,
            timestamp: &self.timestamp,
            correlation_id: &self.correlation_id,
        }
    }
}

impl Serialize for MessageEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}
