// In crates/api-client/src/state.rs

//! Connection state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle state of the live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected, and not trying to be.
    Disconnected,
    /// A physical connection is being opened.
    Connecting,
    /// The connection is open and heartbeating.
    Connected,
    /// Waiting out the backoff delay before the next attempt.
    Reconnecting,
    /// Gave up. Only an explicit `connect()` leaves this state.
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether the manager is currently working towards a connection.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    /// Applies `event` to this state.
    ///
    /// Returns `None` when the event does not apply in this state, which callers
    /// treat as a no-op.
    pub fn transition(self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (Disconnected | Error, ConnectRequested) => Some(Connecting),
            (Connecting | Connected | Reconnecting, ConnectRequested) => None,

            (Connecting, Opened) => Some(Connected),
            (Connecting, OpenFailed { can_retry: true }) => Some(Reconnecting),
            (Connecting, OpenFailed { can_retry: false }) => Some(Error),

            (Connected, ConnectionLost { can_retry: true }) => Some(Reconnecting),
            (Connected, ConnectionLost { can_retry: false }) => Some(Error),

            (Reconnecting, RetryElapsed) => Some(Connecting),

            (Disconnected, DisconnectRequested) => None,
            (_, DisconnectRequested) => Some(Disconnected),

            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested,
    Opened,
    /// The transport failed to open, or the attempt timed out.
    OpenFailed { can_retry: bool },
    /// An open connection closed without `disconnect()` being called.
    ConnectionLost { can_retry: bool },
    RetryElapsed,
    DisconnectRequested,
}

/// Counters describing the connection's history.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    attempts: AtomicU64,
    frames_received: AtomicU64,
    heartbeats_sent: AtomicU64,
    dropped_sends: AtomicU64,
}

impl ConnectionStats {
    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_send(&self) {
        self.dropped_sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Physical connection attempts made since the manager was created.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    /// Sends refused because the connection was not open.
    pub fn dropped_sends(&self) -> u64 {
        self.dropped_sends.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent::*;
    use ConnectionState::*;

    #[test]
    fn test_connect_only_from_idle_states() {
        assert_eq!(Disconnected.transition(ConnectRequested), Some(Connecting));
        assert_eq!(Error.transition(ConnectRequested), Some(Connecting));
        assert_eq!(Connecting.transition(ConnectRequested), None);
        assert_eq!(Connected.transition(ConnectRequested), None);
        assert_eq!(Reconnecting.transition(ConnectRequested), None);
    }

    #[test]
    fn test_failure_paths() {
        assert_eq!(Connecting.transition(OpenFailed { can_retry: true }), Some(Reconnecting));
        assert_eq!(Connecting.transition(OpenFailed { can_retry: false }), Some(Error));
        assert_eq!(Connected.transition(ConnectionLost { can_retry: true }), Some(Reconnecting));
        assert_eq!(Connected.transition(ConnectionLost { can_retry: false }), Some(Error));
        assert_eq!(Reconnecting.transition(RetryElapsed), Some(Connecting));
    }

    #[test]
    fn test_disconnect_from_everywhere() {
        for state in [Connecting, Connected, Reconnecting, Error] {
            assert_eq!(state.transition(DisconnectRequested), Some(Disconnected));
        }
        // Idempotent: a second disconnect changes nothing.
        assert_eq!(Disconnected.transition(DisconnectRequested), None);
    }

    #[test]
    fn test_out_of_place_events_are_ignored() {
        assert_eq!(Disconnected.transition(Opened), None);
        assert_eq!(Connected.transition(Opened), None);
        assert_eq!(Connected.transition(RetryElapsed), None);
        assert_eq!(Disconnected.transition(ConnectionLost { can_retry: true }), None);
        assert_eq!(Error.transition(RetryElapsed), None);
    }

    #[test]
    fn test_state_checks() {
        assert!(Connected.is_connected());
        assert!(!Reconnecting.is_connected());
        assert!(Connecting.is_transitioning());
        assert!(Reconnecting.is_transitioning());
        assert!(!Error.is_transitioning());
        assert_eq!(Reconnecting.to_string(), "Reconnecting");
    }
}
