// In crates/api-client/src/lib.rs

//! Client side of the dashboard's data plane: the live WebSocket connection
//! and HTTP fetches with fallback.

pub mod connection;
pub mod error;
pub mod fallback;
pub mod state;
pub mod transport;

pub use connection::{ConnectionConfig, ConnectionHandler, ConnectionManager, SendOutcome};
pub use error::{Error, Result};
pub use fallback::{
    DataOrigin, FallbackClient, FallbackOptions, FallbackStatus, FetchSource, Fetched, HttpSource,
    fetch_with_fallback,
};
pub use state::{ConnectionEvent, ConnectionState, ConnectionStats};
pub use transport::{Frame, FrameSink, Link, Transport, TransportEvent, WsTransport};
