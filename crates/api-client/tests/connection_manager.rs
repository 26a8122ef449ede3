// In crates/api-client/tests/connection_manager.rs

use api_client::{
    ConnectionConfig, ConnectionHandler, ConnectionManager, ConnectionState, Error, Frame, FrameSink, Link,
    Result, SendOutcome, Transport, TransportEvent,
};
use async_trait::async_trait;
use core_types::{MessageEnvelope, MessageKind};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

#[derive(Debug, Clone, Copy)]
enum Script {
    Open,
    Fail,
    Hang,
}

/// Server side of one mock connection.
#[derive(Clone)]
struct ServerEnd {
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl ServerEnd {
    fn push_text(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Frame(Frame::Text(text.to_string())));
    }

    fn close(&self) {
        let _ = self.events.send(TransportEvent::Closed(Some("going away".into())));
    }

    fn sent_kinds(&self) -> Vec<MessageKind> {
        self.sent
            .lock()
            .iter()
            .map(|text| MessageEnvelope::from_json(text).unwrap().kind())
            .collect()
    }

    fn heartbeats(&self) -> usize {
        self.sent_kinds().into_iter().filter(|k| *k == MessageKind::Heartbeat).count()
    }
}

struct MockSink {
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Plays back a script of open results, then repeats `fallback` forever.
struct MockTransport {
    script: Mutex<VecDeque<Script>>,
    fallback: Script,
    opens: AtomicU32,
    servers: Mutex<Vec<ServerEnd>>,
}

impl MockTransport {
    fn new(script: impl IntoIterator<Item = Script>, fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            opens: AtomicU32::new(0),
            servers: Mutex::new(Vec::new()),
        })
    }

    fn always(script: Script) -> Arc<Self> {
        Self::new([], script)
    }

    fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    fn server(&self, index: usize) -> ServerEnd {
        self.servers.lock()[index].clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &str) -> Result<Link> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front().unwrap_or(self.fallback);
        match step {
            Script::Fail => Err(Error::ConnectFailed {
                url: url.to_string(),
                reason: "connection refused".into(),
            }),
            Script::Hang => std::future::pending::<Result<Link>>().await,
            Script::Open => {
                let (tx, rx) = mpsc::unbounded_channel();
                let server = ServerEnd {
                    events: tx,
                    sent: Arc::default(),
                    closed: Arc::default(),
                };
                self.servers.lock().push(server.clone());
                let events = futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|event| (event, rx))
                });
                Ok(Link {
                    sink: Box::new(MockSink {
                        sent: server.sent,
                        closed: server.closed,
                    }),
                    events: events.boxed(),
                })
            }
        }
    }
}

#[derive(Default)]
struct RecordingHandler {
    states: Mutex<Vec<ConnectionState>>,
    frames: Mutex<Vec<Frame>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingHandler {
    fn states(&self) -> Vec<ConnectionState> {
        self.states.lock().clone()
    }
}

impl ConnectionHandler for RecordingHandler {
    fn on_state_change(&self, state: ConnectionState) {
        self.states.lock().push(state);
    }

    fn on_frame(&self, frame: Frame) {
        self.frames.lock().push(frame);
    }

    fn on_error(&self, error: &Error) {
        self.errors.lock().push(error.to_string());
    }
}

fn test_config(max_reconnect_attempts: u32) -> ConnectionConfig {
    ConnectionConfig {
        url: "ws://dashboard.test/ws".into(),
        heartbeat_interval: Duration::from_millis(1_000),
        reconnect_delay: Duration::from_millis(5_000),
        max_reconnect_attempts,
        connect_timeout: Duration::from_millis(2_000),
    }
}

fn setup(
    transport: &Arc<MockTransport>,
    config: ConnectionConfig,
) -> (ConnectionManager, Arc<RecordingHandler>) {
    let handler = Arc::new(RecordingHandler::default());
    let manager = ConnectionManager::new(config, transport.clone(), handler.clone());
    (manager, handler)
}

async fn wait_for(manager: &ConnectionManager, state: ConnectionState) {
    let mut rx = manager.subscribe_state();
    rx.wait_for(|s| *s == state).await.unwrap();
}

/// Lets spawned tasks run without moving the clock.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_delivers_frames_in_order() {
    use ConnectionState::*;
    let transport = MockTransport::always(Script::Open);
    let (manager, handler) = setup(&transport, test_config(3));

    assert!(manager.connect());
    wait_for(&manager, Connected).await;
    assert_eq!(handler.states(), vec![Connecting, Connected]);

    let server = transport.server(0);
    server.push_text("first");
    server.push_text("second");
    settle().await;

    assert_eq!(
        *handler.frames.lock(),
        vec![Frame::Text("first".into()), Frame::Text("second".into())]
    );
    assert_eq!(manager.stats().frames_received(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_once_per_interval() {
    let transport = MockTransport::always(Script::Open);
    let (manager, _handler) = setup(&transport, test_config(3));

    manager.connect();
    wait_for(&manager, ConnectionState::Connected).await;
    let server = transport.server(0);
    assert_eq!(server.heartbeats(), 0);

    sleep(Duration::from_millis(1_001)).await;
    settle().await;
    assert_eq!(server.heartbeats(), 1);

    sleep(Duration::from_millis(1_000)).await;
    settle().await;
    assert_eq!(server.heartbeats(), 2);
    assert_eq!(manager.stats().heartbeats_sent(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    use ConnectionState::{Connecting, Reconnecting};
    let transport = MockTransport::always(Script::Fail);
    let (manager, handler) = setup(&transport, test_config(3));
    let started = Instant::now();

    manager.connect();
    wait_for(&manager, ConnectionState::Error).await;

    assert_eq!(transport.opens(), 3);
    assert_eq!(manager.stats().attempts(), 3);
    assert_eq!(
        handler.states(),
        vec![Connecting, Reconnecting, Connecting, Reconnecting, Connecting, ConnectionState::Error]
    );
    // Two backoff delays separate the three attempts.
    assert!(started.elapsed() >= Duration::from_millis(10_000));

    // No further attempts are scheduled once in Error.
    sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.opens(), 3);
    assert_eq!(manager.state(), ConnectionState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_successful_open_resets_attempts() {
    let transport = MockTransport::new([Script::Fail, Script::Fail], Script::Open);
    let (manager, _handler) = setup(&transport, test_config(3));

    manager.connect();
    wait_for(&manager, ConnectionState::Connected).await;

    assert_eq!(transport.opens(), 3);
    assert_eq!(manager.attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_reconnects_with_new_socket() {
    use ConnectionState::*;
    let transport = MockTransport::always(Script::Open);
    let (manager, handler) = setup(&transport, test_config(3));

    manager.connect();
    wait_for(&manager, Connected).await;
    transport.server(0).close();

    wait_for(&manager, Reconnecting).await;
    wait_for(&manager, Connected).await;

    assert_eq!(transport.opens(), 2);
    assert_eq!(
        handler.states(),
        vec![Connecting, Connected, Reconnecting, Connecting, Connected]
    );

    // Frames now arrive over the second connection.
    transport.server(1).push_text("after-reconnect");
    settle().await;
    assert_eq!(
        handler.frames.lock().last(),
        Some(&Frame::Text("after-reconnect".into()))
    );
    assert!(!handler.errors.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_without_retries_is_an_error() {
    let transport = MockTransport::always(Script::Open);
    let (manager, _handler) = setup(&transport, test_config(0));

    manager.connect();
    wait_for(&manager, ConnectionState::Connected).await;
    transport.server(0).close();

    wait_for(&manager, ConnectionState::Error).await;
    sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_heartbeat_and_closes_socket() {
    let transport = MockTransport::always(Script::Open);
    let (manager, _handler) = setup(&transport, test_config(3));

    manager.connect();
    wait_for(&manager, ConnectionState::Connected).await;
    let server = transport.server(0);

    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    settle().await;
    assert!(server.closed.load(Ordering::SeqCst));

    sleep(Duration::from_secs(60)).await;
    assert_eq!(server.heartbeats(), 0);
    assert_eq!(transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let transport = MockTransport::always(Script::Fail);
    let (manager, handler) = setup(&transport, test_config(5));

    manager.connect();
    wait_for(&manager, ConnectionState::Reconnecting).await;
    manager.disconnect();

    sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(handler.states().last(), Some(&ConnectionState::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let transport = MockTransport::always(Script::Open);
    let (manager, handler) = setup(&transport, test_config(3));

    // Disconnecting an idle manager does nothing.
    manager.disconnect();
    assert!(handler.states().is_empty());

    manager.connect();
    wait_for(&manager, ConnectionState::Connected).await;
    manager.disconnect();
    manager.disconnect();

    let disconnects = handler
        .states()
        .into_iter()
        .filter(|s| *s == ConnectionState::Disconnected)
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_active_is_a_noop() {
    let transport = MockTransport::always(Script::Open);
    let (manager, _handler) = setup(&transport, test_config(3));

    assert!(manager.connect());
    assert!(!manager.connect());
    wait_for(&manager, ConnectionState::Connected).await;
    assert!(!manager.connect());

    settle().await;
    assert_eq!(transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_error_starts_new_cycle() {
    let transport = MockTransport::new([Script::Fail], Script::Open);
    let (manager, _handler) = setup(&transport, test_config(1));

    manager.connect();
    wait_for(&manager, ConnectionState::Error).await;

    assert!(manager.connect());
    wait_for(&manager, ConnectionState::Connected).await;
    assert_eq!(transport.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_counts_as_failed_attempt() {
    let transport = MockTransport::always(Script::Hang);
    let (manager, handler) = setup(&transport, test_config(1));
    let started = Instant::now();

    manager.connect();
    wait_for(&manager, ConnectionState::Error).await;

    assert!(started.elapsed() >= Duration::from_millis(2_000));
    assert!(handler.errors.lock()[0].contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_send_only_while_connected() {
    let transport = MockTransport::always(Script::Open);
    let (manager, _handler) = setup(&transport, test_config(3));
    let envelope = MessageEnvelope::heartbeat();

    assert_eq!(
        manager.send(&envelope),
        SendOutcome::Dropped(ConnectionState::Disconnected)
    );
    assert_eq!(manager.stats().dropped_sends(), 1);

    manager.connect();
    wait_for(&manager, ConnectionState::Connected).await;
    assert_eq!(manager.send(&envelope), SendOutcome::Sent);
    settle().await;

    let sent = transport.server(0).sent.lock().clone();
    assert_eq!(sent.len(), 1);
    let echoed = MessageEnvelope::from_json(&sent[0]).unwrap();
    assert_eq!(echoed.correlation_id(), envelope.correlation_id());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_close() {
    let transport = MockTransport::always(Script::Open);
    let (manager, _handler) = setup(&transport, test_config(3));

    manager.connect();
    wait_for(&manager, ConnectionState::Connected).await;
    manager.shutdown().await;

    assert!(transport.server(0).closed.load(Ordering::SeqCst));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}
