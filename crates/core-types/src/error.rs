// In crates/core-types/src/error.rs

use thiserror::Error;

/// Reasons an inbound frame could not be turned into a `MessageEnvelope`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Frame is not valid JSON: {0}")]
    MalformedFrame(#[source] serde_json::Error),

    #[error("Frame is missing or has an invalid envelope field: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownKind(String),

    #[error("Payload does not match message type {kind}: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Binary frame is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
