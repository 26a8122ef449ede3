// In crates/store/src/lib.rs

//! The client's view of live trading state: the newest account, position,
//! price and service-status snapshot per entity, fed by the dispatcher and
//! read by the UI.

pub mod snapshot;
pub mod store;

pub use snapshot::{
    AccountSnapshot, Entities, PositionSnapshot, PriceSnapshot, ServiceStatusSnapshot, Snapshot, StoreState,
};
pub use store::{ApplyOutcome, RealTimeStore, StoreStats, Subscription};
