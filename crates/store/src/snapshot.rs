// In crates/store/src/snapshot.rs

use chrono::{DateTime, Utc};
use core_types::{AccountUpdate, PositionUpdate, PriceUpdate, SystemStatus};
use std::collections::HashMap;
use std::sync::Arc;

/// The latest known state of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    pub data: T,
    /// Event time of the message that produced `data`.
    pub last_update: DateTime<Utc>,
}

pub type AccountSnapshot = Snapshot<AccountUpdate>;
pub type PositionSnapshot = Snapshot<PositionUpdate>;
pub type PriceSnapshot = Snapshot<PriceUpdate>;
pub type ServiceStatusSnapshot = Snapshot<SystemStatus>;

/// One entity map. Shared between consecutive states until it is written to.
pub type Entities<T> = Arc<HashMap<String, Snapshot<T>>>;

impl PositionSnapshot {
    /// A position reported with zero volume has been closed. It stays in the
    /// store until the next `reset()`.
    pub fn is_closed(&self) -> bool {
        self.data.volume.is_zero()
    }
}

/// An immutable view of everything the store knows.
///
/// Views are shared through `Arc`; an update produces a new view and never
/// mutates one that has been handed out. Maps an update does not touch are
/// shared with the previous view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    /// Keyed by `account_id`.
    pub accounts: Entities<AccountUpdate>,
    /// Keyed by `position_id`.
    pub positions: Entities<PositionUpdate>,
    /// Keyed by `symbol`.
    pub prices: Entities<PriceUpdate>,
    /// Keyed by `service`.
    pub services: Entities<SystemStatus>,
    /// Incremented every time the state changes.
    pub generation: u64,
}

impl StoreState {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.positions.is_empty() && self.prices.is_empty() && self.services.is_empty()
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &PositionSnapshot> {
        self.positions.values().filter(|p| !p.is_closed())
    }

    /// Services currently reporting `warning` or `error`.
    pub fn degraded_services(&self) -> impl Iterator<Item = &ServiceStatusSnapshot> {
        self.services.values().filter(|s| s.data.status.is_degraded())
    }
}
