// In crates/engine/src/lib.rs

pub mod dispatcher;

pub use dispatcher::{DispatchOutcome, DispatchStats, Dispatcher, MessageHandler};

use anyhow::{Context, Result};
use api_client::{
    ConnectionConfig, ConnectionManager, ConnectionState, FallbackClient, FallbackOptions, HttpSource,
    SendOutcome, Transport, WsTransport,
};
use app_config::Settings;
use core_types::MessageEnvelope;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use store::RealTimeStore;
use tokio::sync::watch;

/// One live dashboard session: a store, the dispatcher feeding it and the
/// connection feeding the dispatcher.
///
/// Nothing is shared between sessions. `teardown()` closes the connection and
/// clears the store.
pub struct Session {
    settings: Settings,
    store: Arc<RealTimeStore>,
    dispatcher: Arc<Dispatcher>,
    connection: ConnectionManager,
}

impl Session {
    /// Builds a session that talks WebSocket to `settings.connection.url`.
    pub fn create(settings: Settings) -> Result<Self> {
        Self::with_transport(settings, Arc::new(WsTransport::new()))
    }

    pub fn with_transport(settings: Settings, transport: Arc<dyn Transport>) -> Result<Self> {
        let config = ConnectionConfig::from_settings(&settings.connection)
            .context("Invalid connection settings")?;

        let store = Arc::new(RealTimeStore::new());
        let dispatcher = Arc::new(Dispatcher::with_store(Arc::clone(&store)));
        let connection = ConnectionManager::new(config, transport, dispatcher.clone());

        tracing::info!(url = %connection.config().url, "Session created.");
        Ok(Self {
            settings,
            store,
            dispatcher,
            connection,
        })
    }

    /// Starts connecting. Returns `false` if the connection is already active.
    pub fn start(&self) -> bool {
        self.connection.connect()
    }

    /// Closes the connection, waits for the socket to shut, then clears the store.
    pub async fn teardown(&self) {
        tracing::info!("Tearing down session...");
        self.connection.shutdown().await;
        self.store.reset();
    }

    pub fn send(&self, envelope: &MessageEnvelope) -> SendOutcome {
        self.connection.send(envelope)
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn store(&self) -> &Arc<RealTimeStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// An HTTP resource with fallback, configured from this session's settings.
    pub fn fallback_client<T>(&self, resource: &str, fallback: Option<T>) -> Result<FallbackClient<T>>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let source = HttpSource::new(&self.settings.fallback).context("Failed to build HTTP client")?;
        Ok(FallbackClient::new(
            Arc::new(source),
            resource,
            fallback,
            FallbackOptions::from_settings(&self.settings.fallback),
        ))
    }
}
