// In crates/store/src/store.rs

use crate::snapshot::{
    AccountSnapshot, PositionSnapshot, PriceSnapshot, ServiceStatusSnapshot, Snapshot, StoreState,
};
use chrono::{DateTime, Utc};
use core_types::{MessageEnvelope, Payload};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// What `process_message` did with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First message for this key.
    Inserted,
    /// Replaced the snapshot for this key.
    Updated,
    /// Re-delivery of the message already applied.
    Unchanged,
    /// Older than the snapshot already held; dropped.
    Stale,
    /// Kind carries no entity (heartbeats).
    Ignored,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

/// Counters for messages seen by the store.
#[derive(Debug, Default)]
pub struct StoreStats {
    applied: AtomicU64,
    unchanged: AtomicU64,
    stale: AtomicU64,
    ignored: AtomicU64,
}

impl StoreStats {
    fn record(&self, outcome: ApplyOutcome) {
        let counter = match outcome {
            ApplyOutcome::Inserted | ApplyOutcome::Updated => &self.applied,
            ApplyOutcome::Unchanged => &self.unchanged,
            ApplyOutcome::Stale => &self.stale,
            ApplyOutcome::Ignored => &self.ignored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn unchanged(&self) -> u64 {
        self.unchanged.load(Ordering::Relaxed)
    }

    /// Out-of-order messages dropped.
    pub fn stale(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }

    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }
}

type Callback = Arc<dyn Fn(&Arc<StoreState>) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback)>>,
}

impl Subscribers {
    fn remove(&self, id: u64) {
        self.entries.lock().retain(|(entry_id, _)| *entry_id != id);
    }

    fn snapshot(&self) -> Vec<Callback> {
        self.entries.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }
}

/// Handle returned by [`RealTimeStore::subscribe`].
///
/// The callback stays registered until `unsubscribe()` is called or the
/// handle is dropped, whichever comes first.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Subscribers>,
    active: AtomicBool,
}

impl Subscription {
    /// Removes the callback. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.remove(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Marks the store as mid-write for as long as it is held.
struct WriteGuard<'a>(ReentrantMutexGuard<'a, Cell<bool>>);

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Session-scoped container for the latest state of every live entity.
///
/// Writes are serialized; readers get an immutable `Arc<StoreState>` and never
/// block a writer for longer than a pointer swap.
pub struct RealTimeStore {
    current: RwLock<Arc<StoreState>>,
    /// Held for the whole of a write, notifications included, so subscribers
    /// observe updates in the order they were applied. Reentrant so that a
    /// callback writing back is caught instead of deadlocking.
    writer: ReentrantMutex<Cell<bool>>,
    subscribers: Arc<Subscribers>,
    stats: StoreStats,
}

impl Default for RealTimeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RealTimeStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(StoreState::default())),
            writer: ReentrantMutex::new(Cell::new(false)),
            subscribers: Arc::default(),
            stats: StoreStats::default(),
        }
    }

    /// Applies one envelope, keeping the newest snapshot per key by event time.
    ///
    /// Subscribers are notified synchronously, and only when something changed.
    ///
    /// # Panics
    ///
    /// If called from inside a subscriber callback.
    pub fn process_message(&self, envelope: &MessageEnvelope) -> ApplyOutcome {
        let _writer = self.begin_write();
        let current = self.get_state();
        let timestamp = envelope.timestamp();

        let outcome = classify(&current, envelope.payload(), timestamp);
        self.stats.record(outcome);

        match outcome {
            ApplyOutcome::Stale => {
                tracing::debug!(
                    kind = %envelope.kind(),
                    key = envelope.payload().entity_key().unwrap_or_default(),
                    %timestamp,
                    "Dropped out-of-order update."
                );
                return outcome;
            }
            ApplyOutcome::Unchanged | ApplyOutcome::Ignored => return outcome,
            ApplyOutcome::Inserted | ApplyOutcome::Updated => {}
        }

        let mut next = StoreState::clone(&current);
        write(&mut next, envelope.payload(), timestamp);
        next.generation = current.generation + 1;
        self.publish(next);
        outcome
    }

    /// The current state. Cheap; never blocks on a writer's notifications.
    pub fn get_state(&self) -> Arc<StoreState> {
        self.current.read().clone()
    }

    /// Registers `callback`, invoked with the new state after every change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<StoreState>) + Send + Sync + 'static,
    {
        let id = self.subscribers.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.entries.lock().push((id, Arc::new(callback)));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
            active: AtomicBool::new(true),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.entries.lock().len()
    }

    /// Forgets every entity. Used when a session ends or the account changes.
    ///
    /// # Panics
    ///
    /// If called from inside a subscriber callback.
    pub fn reset(&self) {
        let _writer = self.begin_write();
        let generation = self.get_state().generation + 1;
        tracing::info!(generation, "Store reset.");
        self.publish(StoreState {
            generation,
            ..StoreState::default()
        });
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn account(&self, account_id: &str) -> Option<AccountSnapshot> {
        self.current.read().accounts.get(account_id).cloned()
    }

    pub fn position(&self, position_id: &str) -> Option<PositionSnapshot> {
        self.current.read().positions.get(position_id).cloned()
    }

    pub fn price(&self, symbol: &str) -> Option<PriceSnapshot> {
        self.current.read().prices.get(symbol).cloned()
    }

    pub fn service(&self, service: &str) -> Option<ServiceStatusSnapshot> {
        self.current.read().services.get(service).cloned()
    }

    fn begin_write(&self) -> WriteGuard<'_> {
        let guard = self.writer.lock();
        assert!(!guard.get(), "RealTimeStore written to from inside a subscriber callback");
        guard.set(true);
        WriteGuard(guard)
    }

    /// Swaps in `next` and notifies subscribers. Caller holds the writer lock.
    fn publish(&self, next: StoreState) {
        let next = Arc::new(next);
        {
            let mut current = self.current.write();
            debug_assert!(next.generation > current.generation, "store generation must increase");
            *current = Arc::clone(&next);
        }
        // Callbacks run without the subscriber list locked so they may unsubscribe.
        for callback in self.subscribers.snapshot() {
            callback(&next);
        }
    }
}

fn classify(state: &StoreState, payload: &Payload, timestamp: DateTime<Utc>) -> ApplyOutcome {
    match payload {
        Payload::Account(a) => compare(&state.accounts, &a.account_id, a, timestamp),
        Payload::Position(p) => compare(&state.positions, &p.position_id, p, timestamp),
        Payload::Price(p) => compare(&state.prices, &p.symbol, p, timestamp),
        Payload::Status(s) => compare(&state.services, &s.service, s, timestamp),
        Payload::Heartbeat(_) => ApplyOutcome::Ignored,
    }
}

fn compare<T: PartialEq>(
    map: &HashMap<String, Snapshot<T>>,
    key: &str,
    data: &T,
    timestamp: DateTime<Utc>,
) -> ApplyOutcome {
    match map.get(key) {
        None => ApplyOutcome::Inserted,
        Some(existing) if timestamp < existing.last_update => ApplyOutcome::Stale,
        // Equal timestamps: the later arrival wins unless it is the same message.
        Some(existing) if timestamp == existing.last_update && existing.data == *data => ApplyOutcome::Unchanged,
        Some(_) => ApplyOutcome::Updated,
    }
}

/// Copies only the map the payload belongs to; the others stay shared.
fn write(state: &mut StoreState, payload: &Payload, timestamp: DateTime<Utc>) {
    match payload {
        Payload::Account(a) => upsert(Arc::make_mut(&mut state.accounts), &a.account_id, a, timestamp),
        Payload::Position(p) => upsert(Arc::make_mut(&mut state.positions), &p.position_id, p, timestamp),
        Payload::Price(p) => upsert(Arc::make_mut(&mut state.prices), &p.symbol, p, timestamp),
        Payload::Status(s) => upsert(Arc::make_mut(&mut state.services), &s.service, s, timestamp),
        Payload::Heartbeat(_) => {}
    }
}

fn upsert<T: Clone>(map: &mut HashMap<String, Snapshot<T>>, key: &str, data: &T, timestamp: DateTime<Utc>) {
    map.insert(
        key.to_string(),
        Snapshot {
            data: data.clone(),
            last_update: timestamp,
        },
    );
}
