// In crates/core-types/src/types.rs

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// Health of a backend service as reported by `system_status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Active,
    Inactive,
    Warning,
    Error,
}

impl ServiceState {
    /// Whether the service is in a state the dashboard should flag.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Warning | Self::Error)
    }
}

/// Payload of an `account_update` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountUpdate {
    /// Stable identifier of the trading account.
    pub account_id: String,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
    /// Equity over used margin, as a percentage.
    pub margin_level: Decimal,
}

/// Payload of a `position_update` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub position_id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    /// Open volume in lots. Zero means the position has been closed.
    pub volume: Decimal,
    pub open_price: Decimal,
    pub current_price: Decimal,
    pub profit: Decimal,
    pub swap: Decimal,
    pub commission: Decimal,
}

/// Payload of a `price_update` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    /// Quote time as stamped by the price source.
    #[serde(deserialize_with = "crate::timestamp::deserialize")]
    pub timestamp: DateTime<Utc>,
}

impl PriceUpdate {
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Payload of a `system_status` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Name of the reporting service; the store key.
    pub service: String,
    pub status: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(deserialize_with = "crate::timestamp::deserialize")]
    pub last_updated: DateTime<Utc>,
}

/// Payload of a `heartbeat` message. Carries no data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {}
