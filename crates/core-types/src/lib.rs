// In crates/core-types/src/lib.rs

pub mod envelope;
pub mod error;
pub mod timestamp;
pub mod types;

// Re-export the most important types for easy access from other crates.
pub use envelope::{CorrelationId, MessageEnvelope, MessageKind, Payload};
pub use error::{Error, Result};
pub use types::{
    AccountUpdate, Heartbeat, PositionUpdate, PriceUpdate, ServiceState, Side, SystemStatus,
};
