// In crates/api-client/src/transport.rs

use crate::{Error, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures::stream::{BoxStream, SplitSink};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A data frame received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Everything an open connection can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Frame),
    /// The peer closed the connection, with its close reason if it sent one.
    Closed(Option<String>),
    Error(String),
}

/// Write half of an open connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    async fn close(&mut self);
}

/// An open physical connection, split into its write half and its event stream.
///
/// The stream ending without a `Closed` event counts as an abnormal close.
pub struct Link {
    pub sink: Box<dyn FrameSink>,
    pub events: BoxStream<'static, TransportEvent>,
}

/// Opens physical connections. Every call must produce a fresh connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Link>;
}

/// The production transport: WebSocket over `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.0
            .send(Message::text(text))
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.0.close().await {
            tracing::debug!(error = %e, "Error while closing WebSocket");
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<Link> {
        let (ws_stream, _) = connect_async(url).await.map_err(|e| Error::ConnectFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let (sink, mut read) = ws_stream.split();

        let events = stream! {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => yield TransportEvent::Frame(Frame::Text(text.as_str().to_owned())),
                    Ok(Message::Binary(bytes)) => yield TransportEvent::Frame(Frame::Binary(bytes.to_vec())),
                    Ok(Message::Close(frame)) => {
                        yield TransportEvent::Closed(frame.map(|f| f.reason.as_str().to_owned()));
                        break;
                    }
                    // Pings are answered by tungstenite itself.
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                    Err(e) => {
                        yield TransportEvent::Error(e.to_string());
                        break;
                    }
                }
            }
        };

        Ok(Link {
            sink: Box::new(WsSink(sink)),
            events: events.boxed(),
        })
    }
}
