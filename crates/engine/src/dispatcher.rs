// In crates/engine/src/dispatcher.rs

use api_client::{ConnectionHandler, ConnectionState, Frame};
use chrono::{DateTime, Utc};
use core_types::{MessageEnvelope, MessageKind};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use store::RealTimeStore;

/// Consumer of one kind of decoded envelope.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, envelope: &MessageEnvelope);
}

impl<F> MessageHandler for F
where
    F: Fn(&MessageEnvelope) + Send + Sync,
{
    fn handle(&self, envelope: &MessageEnvelope) {
        self(envelope)
    }
}

/// What happened to one inbound frame.
#[derive(Debug)]
pub enum DispatchOutcome {
    Routed(MessageKind),
    /// Decoded, but nothing is registered for its kind.
    Unhandled(MessageKind),
    /// Could not be decoded; the frame was dropped.
    Rejected(core_types::Error),
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    routed: AtomicU64,
    unhandled: AtomicU64,
    rejected: AtomicU64,
    transport_errors: AtomicU64,
}

impl DispatchStats {
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    pub fn unhandled(&self) -> u64 {
        self.unhandled.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn transport_errors(&self) -> u64 {
        self.transport_errors.load(Ordering::Relaxed)
    }
}

/// Decodes inbound frames and routes each envelope to the handler for its kind.
///
/// Frames are handled synchronously, in the order the connection delivers them.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<MessageKind, Arc<dyn MessageHandler>>>,
    last_server_heartbeat: Arc<Mutex<Option<DateTime<Utc>>>>,
    connection_state: Mutex<Option<ConnectionState>>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher feeding every entity kind into `store` and tracking
    /// server heartbeats.
    pub fn with_store(store: Arc<RealTimeStore>) -> Self {
        let dispatcher = Self::new();
        for kind in MessageKind::ALL {
            match kind {
                MessageKind::AccountUpdate
                | MessageKind::PositionUpdate
                | MessageKind::PriceUpdate
                | MessageKind::SystemStatus => {
                    let store = Arc::clone(&store);
                    dispatcher.register(kind, move |envelope: &MessageEnvelope| {
                        store.process_message(envelope);
                    });
                }
                MessageKind::Heartbeat => {
                    let last_seen = Arc::clone(&dispatcher.last_server_heartbeat);
                    dispatcher.register(kind, move |envelope: &MessageEnvelope| {
                        *last_seen.lock() = Some(envelope.timestamp());
                    });
                }
            }
        }
        dispatcher
    }

    /// Routes `kind` to `handler`, replacing any handler already registered.
    pub fn register<H>(&self, kind: MessageKind, handler: H)
    where
        H: MessageHandler + 'static,
    {
        if self.handlers.write().insert(kind, Arc::new(handler)).is_some() {
            tracing::debug!(%kind, "Replaced message handler.");
        }
    }

    pub fn unregister(&self, kind: MessageKind) -> bool {
        self.handlers.write().remove(&kind).is_some()
    }

    pub fn dispatch_frame(&self, frame: &Frame) -> DispatchOutcome {
        let decoded = match frame {
            Frame::Text(text) => MessageEnvelope::from_json(text),
            Frame::Binary(bytes) => MessageEnvelope::from_bytes(bytes),
        };
        match decoded {
            Ok(envelope) => self.dispatch(&envelope),
            Err(error) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%error, "Dropped undecodable frame.");
                DispatchOutcome::Rejected(error)
            }
        }
    }

    pub fn dispatch(&self, envelope: &MessageEnvelope) -> DispatchOutcome {
        let kind = envelope.kind();
        // Clone the handler out so it runs without the registry locked.
        let handler = self.handlers.read().get(&kind).cloned();
        match handler {
            Some(handler) => {
                handler.handle(envelope);
                self.stats.routed.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::Routed(kind)
            }
            None => {
                self.stats.unhandled.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%kind, correlation_id = %envelope.correlation_id(), "No handler registered for message.");
                DispatchOutcome::Unhandled(kind)
            }
        }
    }

    /// Event time of the last heartbeat received from the server.
    pub fn last_server_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self.last_server_heartbeat.lock()
    }

    /// The most recent state reported by the connection, if any.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        *self.connection_state.lock()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}

impl ConnectionHandler for Dispatcher {
    fn on_state_change(&self, state: ConnectionState) {
        *self.connection_state.lock() = Some(state);
    }

    fn on_frame(&self, frame: Frame) {
        self.dispatch_frame(&frame);
    }

    fn on_error(&self, error: &api_client::Error) {
        self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%error, "Transport error reported to dispatcher.");
    }
}
