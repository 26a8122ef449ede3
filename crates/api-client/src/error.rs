// In crates/api-client/src/error.rs

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to open connection to {url}: {reason}")]
    ConnectFailed { url: String, reason: String },
    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Upstream returned HTTP {0}")]
    HttpStatus(u16),
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(#[from] serde_json::Error),
    #[error("Envelope error: {0}")]
    Envelope(#[from] core_types::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] app_config::Error),
    #[error("Request was cancelled")]
    Cancelled,
    #[error("Fetching is disabled")]
    Disabled,
    #[error("No live data or fallback available for {resource}: {source}")]
    Unavailable {
        resource: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
