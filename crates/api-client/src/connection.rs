// In crates/api-client/src/connection.rs

use crate::state::{ConnectionEvent, ConnectionState, ConnectionStats};
use crate::transport::{Frame, Link, Transport, TransportEvent};
use crate::{Error, Result};
use app_config::ConnectionSettings;
use core_types::MessageEnvelope;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;

/// How long a graceful close may take before the socket is simply dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives everything the connection manager observes, in delivery order.
///
/// Callbacks run on the manager's driver task and must not block.
pub trait ConnectionHandler: Send + Sync {
    fn on_state_change(&self, state: ConnectionState) {
        let _ = state;
    }

    fn on_frame(&self, frame: Frame);

    /// Transport-level failures. These never need handling to keep the
    /// connection alive; the manager recovers by itself.
    fn on_error(&self, error: &Error) {
        let _ = error;
    }
}

/// Tuning for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    /// Consecutive failed attempts tolerated before entering `Error`.
    /// Zero disables automatic reconnection.
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws".into(),
            heartbeat_interval: Duration::from_millis(30_000),
            reconnect_delay: Duration::from_millis(5_000),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_millis(10_000),
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &ConnectionSettings) -> Result<Self> {
        Ok(Self {
            url: settings.endpoint()?.to_string(),
            heartbeat_interval: settings.heartbeat_interval(),
            reconnect_delay: settings.reconnect_delay(),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            connect_timeout: settings.connect_timeout(),
        })
    }
}

/// Result of [`ConnectionManager::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the open connection's writer.
    Sent,
    /// Refused because the connection was not open. Nothing is queued.
    Dropped(ConnectionState),
}

/// Everything the manager mutates, kept in one place so teardown is auditable.
struct ConnectionRecord {
    state: ConnectionState,
    /// Consecutive physical attempts in the current cycle; reset on open.
    attempt_count: u32,
    /// Bumped by every `connect()` and `disconnect()`; a driver whose epoch is
    /// stale may no longer change anything.
    epoch: u64,
    /// Cancels the heartbeat, the reconnect delay, and any pending open.
    cancel: Option<CancellationToken>,
    driver: Option<JoinHandle<()>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct Shared {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn ConnectionHandler>,
    record: Mutex<ConnectionRecord>,
    state_tx: watch::Sender<ConnectionState>,
    stats: ConnectionStats,
}

enum LinkEnd {
    Cancelled,
    Lost(Error),
}

/// Owns exactly one logical connection at a time.
///
/// `connect()` returns immediately; progress is reported through
/// [`ConnectionManager::subscribe_state`] and the [`ConnectionHandler`].
/// Must be used from within a Tokio runtime.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                handler,
                record: Mutex::new(ConnectionRecord {
                    state: ConnectionState::Disconnected,
                    attempt_count: 0,
                    epoch: 0,
                    cancel: None,
                    driver: None,
                    outbound: None,
                }),
                state_tx,
                stats: ConnectionStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.record.lock().state
    }

    /// A receiver that always holds the latest state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Consecutive attempts made in the current connect cycle.
    pub fn attempt_count(&self) -> u32 {
        self.shared.record.lock().attempt_count
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.shared.stats
    }

    /// Starts connecting. A no-op unless the state is `Disconnected` or `Error`.
    ///
    /// Returns whether a new connect cycle was started.
    pub fn connect(&self) -> bool {
        let (next, epoch, cancel) = {
            let mut record = self.shared.record.lock();
            let Some(next) = record.state.transition(ConnectionEvent::ConnectRequested) else {
                tracing::debug!(state = %record.state, "connect() ignored, connection already in progress");
                return false;
            };
            record.state = next;
            record.attempt_count = 0;
            record.epoch += 1;
            let cancel = CancellationToken::new();
            record.cancel = Some(cancel.clone());
            self.shared.state_tx.send_replace(next);
            (next, record.epoch, cancel)
        };
        self.shared.handler.on_state_change(next);

        let driver = tokio::spawn(drive(Arc::clone(&self.shared), cancel, epoch));
        let mut record = self.shared.record.lock();
        if record.epoch == epoch {
            record.driver = Some(driver);
        }
        true
    }

    /// Tears the connection down. Idempotent.
    ///
    /// The heartbeat and any pending reconnect are cancelled before the socket
    /// is closed; nothing scheduled by this connection fires afterwards.
    pub fn disconnect(&self) {
        let (previous, cancel) = {
            let mut record = self.shared.record.lock();
            record.epoch += 1;
            record.attempt_count = 0;
            record.outbound = None;
            // The driver observes the cancellation, closes the socket and exits.
            record.driver = None;
            let cancel = record.cancel.take();
            let previous = record.state;
            if let Some(next) = previous.transition(ConnectionEvent::DisconnectRequested) {
                record.state = next;
                self.shared.state_tx.send_replace(next);
            }
            (previous, cancel)
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if previous != ConnectionState::Disconnected {
            tracing::info!(url = %self.shared.config.url, from = %previous, "Connection closed by client.");
            self.shared.handler.on_state_change(ConnectionState::Disconnected);
        }
    }

    /// Disconnects and waits for the driver task to finish closing the socket.
    pub async fn shutdown(&self) {
        let driver = self.shared.record.lock().driver.take();
        self.disconnect();
        if let Some(mut driver) = driver {
            if timeout(CLOSE_TIMEOUT * 2, &mut driver).await.is_err() {
                driver.abort();
            }
        }
    }

    /// Sends `envelope` if the connection is open.
    ///
    /// Never fails: a send while not connected is logged, counted and
    /// reported as [`SendOutcome::Dropped`].
    pub fn send(&self, envelope: &MessageEnvelope) -> SendOutcome {
        let (state, outbound) = {
            let record = self.shared.record.lock();
            (record.state, record.outbound.clone())
        };

        let outbound = match outbound {
            Some(outbound) if state.is_connected() => outbound,
            _ => return self.drop_send(envelope, state),
        };

        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, kind = %envelope.kind(), "Failed to encode outbound envelope.");
                return self.drop_send(envelope, state);
            }
        };

        match outbound.send(text) {
            Ok(()) => SendOutcome::Sent,
            Err(_) => self.drop_send(envelope, state),
        }
    }

    fn drop_send(&self, envelope: &MessageEnvelope, state: ConnectionState) -> SendOutcome {
        self.shared.stats.record_dropped_send();
        tracing::warn!(
            kind = %envelope.kind(),
            correlation_id = %envelope.correlation_id(),
            %state,
            "Dropped send: connection is not open."
        );
        SendOutcome::Dropped(state)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Shared {
    /// Applies `event` if `epoch` is still current. Returns the new state.
    fn apply(&self, epoch: u64, event: ConnectionEvent) -> Option<ConnectionState> {
        let (from, next) = {
            let mut record = self.record.lock();
            if record.epoch != epoch {
                return None;
            }
            let from = record.state;
            let next = from.transition(event)?;
            record.state = next;
            if !next.is_connected() {
                record.outbound = None;
            }
            self.state_tx.send_replace(next);
            (from, next)
        };
        tracing::info!(url = %self.config.url, %from, to = %next, "Connection state changed.");
        self.handler.on_state_change(next);
        Some(next)
    }

    /// Counts a new physical attempt. Returns its number within the cycle.
    fn begin_attempt(&self, epoch: u64) -> Option<u32> {
        let mut record = self.record.lock();
        if record.epoch != epoch {
            return None;
        }
        record.attempt_count += 1;
        self.stats.record_attempt();
        Some(record.attempt_count)
    }

    fn mark_open(&self, epoch: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        {
            let mut record = self.record.lock();
            if record.epoch != epoch {
                return false;
            }
            record.attempt_count = 0;
            record.outbound = Some(outbound);
        }
        self.apply(epoch, ConnectionEvent::Opened) == Some(ConnectionState::Connected)
    }

    fn can_retry(&self, epoch: u64) -> bool {
        let record = self.record.lock();
        record.epoch == epoch && record.attempt_count < self.config.max_reconnect_attempts
    }
}

/// One connect cycle: open, run, and reconnect until cancelled or out of attempts.
async fn drive(shared: Arc<Shared>, cancel: CancellationToken, epoch: u64) {
    let config = &shared.config;
    loop {
        let Some(attempt) = shared.begin_attempt(epoch) else {
            return;
        };
        tracing::info!(url = %config.url, attempt, "Opening connection...");

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = timeout(config.connect_timeout, shared.transport.open(&config.url)) => {
                result.unwrap_or(Err(Error::ConnectTimeout(config.connect_timeout)))
            }
        };

        let next = match opened {
            Ok(link) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                if !shared.mark_open(epoch, outbound_tx) {
                    return;
                }
                tracing::info!(url = %config.url, "Connection established.");
                match run_link(&shared, link, outbound_rx, &cancel).await {
                    LinkEnd::Cancelled => return,
                    LinkEnd::Lost(error) => {
                        tracing::warn!(error = %error, "Connection lost.");
                        shared.handler.on_error(&error);
                        let can_retry = config.max_reconnect_attempts > 0;
                        shared.apply(epoch, ConnectionEvent::ConnectionLost { can_retry })
                    }
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, attempt, max = config.max_reconnect_attempts, "Connection attempt failed.");
                shared.handler.on_error(&error);
                let can_retry = shared.can_retry(epoch);
                shared.apply(epoch, ConnectionEvent::OpenFailed { can_retry })
            }
        };

        match next {
            Some(ConnectionState::Reconnecting) => {}
            Some(ConnectionState::Error) => {
                tracing::error!(url = %config.url, "Reconnect attempts exhausted; waiting for an explicit connect().");
                return;
            }
            _ => return,
        }

        tracing::info!(delay_ms = config.reconnect_delay.as_millis() as u64, "Reconnecting after delay...");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = sleep(config.reconnect_delay) => {}
        }
        if shared.apply(epoch, ConnectionEvent::RetryElapsed) != Some(ConnectionState::Connecting) {
            return;
        }
    }
}

/// Pumps one open connection until it ends or the cycle is cancelled.
async fn run_link(
    shared: &Shared,
    link: Link,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> LinkEnd {
    let Link { mut sink, mut events } = link;
    let period = shared.config.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
                    tracing::debug!("Graceful close timed out; dropping socket.");
                }
                return LinkEnd::Cancelled;
            }

            event = events.next() => match event {
                Some(TransportEvent::Frame(frame)) => {
                    shared.stats.record_frame();
                    shared.handler.on_frame(frame);
                }
                Some(TransportEvent::Closed(reason)) => {
                    let reason = reason.unwrap_or_else(|| "closed by server".to_string());
                    return LinkEnd::Lost(Error::ConnectionClosed(reason));
                }
                Some(TransportEvent::Error(e)) => return LinkEnd::Lost(Error::Transport(e)),
                None => return LinkEnd::Lost(Error::ConnectionClosed("stream ended".to_string())),
            },

            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send_text(text).await {
                    tracing::warn!(error = %e, "Failed to send frame.");
                    shared.handler.on_error(&e);
                }
            }

            _ = heartbeat.tick() => {
                let envelope = MessageEnvelope::heartbeat();
                let sent = match envelope.to_json() {
                    Ok(text) => sink.send_text(text).await,
                    Err(e) => Err(e.into()),
                };
                // A failed heartbeat is not a reason to reconnect; only the
                // transport closing is.
                match sent {
                    Ok(()) => {
                        shared.stats.record_heartbeat();
                        tracing::debug!(correlation_id = %envelope.correlation_id(), "Heartbeat sent.");
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to send heartbeat."),
                }
            }
        }
    }
}
