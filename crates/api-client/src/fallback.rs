// In crates/api-client/src/fallback.rs

//! Degraded-mode access to HTTP JSON resources.
//!
//! A [`FallbackClient`] lets a feature depend on an upstream that may be down.
//! Failed fetches are answered with the last value that was fetched
//! successfully, or the caller's fallback value, and the client keeps retrying
//! on a fixed interval until the upstream answers again. The status is
//! observable so the UI can flag stale data instead of presenting it as live.

use crate::{Error, Result};
use app_config::FallbackSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Somewhere JSON documents can be fetched from.
#[async_trait]
pub trait FetchSource: Send + Sync + 'static {
    /// Fetches `resource`. Implementations must abort the request once
    /// `cancel` fires.
    async fn fetch(&self, resource: &str, cancel: CancellationToken) -> Result<Value>;
}

/// Fetches JSON over HTTP(S) with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpSource {
    http_client: reqwest::Client,
    settings: FallbackSettings,
}

impl HttpSource {
    pub fn new(settings: &FallbackSettings) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self::with_client(http_client, settings))
    }

    /// Uses a caller-configured client (proxies, TLS roots, default headers).
    pub fn with_client(http_client: reqwest::Client, settings: &FallbackSettings) -> Self {
        Self {
            http_client,
            settings: settings.clone(),
        }
    }
}

#[async_trait]
impl FetchSource for HttpSource {
    async fn fetch(&self, resource: &str, cancel: CancellationToken) -> Result<Value> {
        let url = self.settings.resolve(resource)?;

        let request = async {
            let response = self
                .http_client
                .get(url)
                .header(ACCEPT, "application/json")
                .send()
                .await
                .map_err(Error::RequestFailed)?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::HttpStatus(status.as_u16()));
            }
            response.json::<Value>().await.map_err(Error::RequestFailed)
        };

        // Dropping the request future aborts the underlying HTTP exchange.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = request => result,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FallbackOptions {
    /// Delay between retries while the upstream is unreachable.
    pub retry_interval: Duration,
    pub enabled: bool,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(30_000),
            enabled: true,
        }
    }
}

impl FallbackOptions {
    pub fn from_settings(settings: &FallbackSettings) -> Self {
        Self {
            retry_interval: settings.retry_interval(),
            enabled: true,
        }
    }
}

/// Where a served value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOrigin {
    /// Fetched just now.
    Live,
    /// The last successfully fetched value.
    LastKnownGood,
    /// The value supplied by the caller.
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub origin: DataOrigin,
}

impl<T> Fetched<T> {
    pub fn is_live(&self) -> bool {
        self.origin == DataOrigin::Live
    }
}

/// Observable health of a fallback-backed resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FallbackStatus {
    /// The last attempt reached the upstream.
    pub online: bool,
    /// The value being served is not fresh.
    pub using_fallback: bool,
    /// When real data was last confirmed fresh.
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

struct Inner<T> {
    source: Arc<dyn FetchSource>,
    resource: String,
    fallback: Option<T>,
    options: FallbackOptions,
    enabled: AtomicBool,
    torn_down: AtomicBool,
    /// Sequence number of the most recent attempt.
    attempts: AtomicU64,
    /// Sequence number of the newest attempt whose outcome reached `status`.
    settled: Mutex<u64>,
    last_good: Mutex<Option<T>>,
    status: watch::Sender<FallbackStatus>,
    /// Parent of every request token; replaced when re-enabled.
    lifetime: Mutex<CancellationToken>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

/// A resource fetched with fallback and periodic retry.
///
/// Dropping the client tears it down: the retry timer stops and any in-flight
/// request is aborted.
pub struct FallbackClient<T> {
    inner: Arc<Inner<T>>,
}

impl<T> FallbackClient<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        source: Arc<dyn FetchSource>,
        resource: impl Into<String>,
        fallback: Option<T>,
        options: FallbackOptions,
    ) -> Self {
        let (status, _) = watch::channel(FallbackStatus::default());
        let enabled = options.enabled;
        Self {
            inner: Arc::new(Inner {
                source,
                resource: resource.into(),
                fallback,
                options,
                enabled: AtomicBool::new(enabled),
                torn_down: AtomicBool::new(false),
                attempts: AtomicU64::new(0),
                settled: Mutex::new(0),
                last_good: Mutex::new(None),
                status,
                lifetime: Mutex::new(CancellationToken::new()),
                retry_task: Mutex::new(None),
            }),
        }
    }

    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    pub fn status(&self) -> FallbackStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<FallbackStatus> {
        self.inner.status.subscribe()
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.inner.status.borrow().last_seen
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Attempts one fetch, degrading to last-known-good or fallback data.
    ///
    /// Fails only when the upstream is unreachable and there is nothing to
    /// serve, when the client is disabled, or when the request was cancelled.
    pub async fn fetch_with_fallback(&self) -> Result<Fetched<T>> {
        self.inner.attempt().await
    }

    /// Fetches immediately, regardless of the retry timer.
    pub async fn refetch(&self) -> Result<Fetched<T>> {
        tracing::debug!(resource = %self.inner.resource, "Manual refetch.");
        self.inner.attempt().await
    }

    /// Starts the background loop: one fetch now, then a retry every
    /// `retry_interval` while the upstream is offline.
    pub fn start(&self) {
        if !self.is_enabled() || self.inner.torn_down.load(Ordering::SeqCst) {
            return;
        }
        let mut retry_task = self.inner.retry_task.lock();
        if retry_task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let token = self.inner.lifetime.lock().clone();
        *retry_task = Some(tokio::spawn(retry_loop(Arc::clone(&self.inner), token)));
    }

    /// Turning fetching off stops retries and aborts any in-flight request.
    /// Turning it back on restarts the retry loop if it had been started.
    /// Has no effect once the client is torn down.
    pub fn set_enabled(&self, enabled: bool) {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            tracing::debug!(resource = %self.inner.resource, "Ignoring set_enabled on torn-down client.");
            return;
        }
        let was_enabled = self.inner.enabled.swap(enabled, Ordering::SeqCst);
        if was_enabled == enabled {
            return;
        }
        if enabled {
            *self.inner.lifetime.lock() = CancellationToken::new();
            let had_loop = self.inner.retry_task.lock().take().is_some();
            if had_loop {
                self.start();
            }
        } else {
            tracing::info!(resource = %self.inner.resource, "Fetching disabled.");
            self.inner.lifetime.lock().cancel();
            // Keep the finished handle so re-enabling knows to restart.
            if let Some(task) = self.inner.retry_task.lock().as_ref() {
                task.abort();
            }
        }
    }

    /// Stops the retry loop and aborts in-flight requests for good. Idempotent.
    pub fn teardown(&self) {
        self.inner.teardown();
    }
}

impl<T> Drop for FallbackClient<T> {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl<T> Inner<T> {
    fn teardown(&self) {
        self.torn_down.store(true, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
        self.lifetime.lock().cancel();
        if let Some(task) = self.retry_task.lock().take() {
            task.abort();
        }
    }
}

impl<T> Inner<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn attempt(&self) -> Result<Fetched<T>> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(Error::Disabled);
        }
        let seq = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.lifetime.lock().child_token();

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = self.source.fetch(&self.resource, token.clone()) => {
                result.and_then(|value| serde_json::from_value::<T>(value).map_err(Error::from))
            }
        };

        match result {
            Ok(value) => {
                self.apply_outcome(seq, |status| {
                    *self.last_good.lock() = Some(value.clone());
                    status.online = true;
                    status.using_fallback = false;
                    status.last_seen = Some(Utc::now());
                    status.last_error = None;
                    status.consecutive_failures = 0;
                });
                tracing::debug!(resource = %self.resource, "Fetched live data.");
                Ok(Fetched {
                    value,
                    origin: DataOrigin::Live,
                })
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(error) => self.degrade(seq, error),
        }
    }

    /// Applies an attempt's outcome unless a later attempt already settled.
    fn apply_outcome(&self, seq: u64, update: impl FnOnce(&mut FallbackStatus)) {
        let mut settled = self.settled.lock();
        if seq < *settled {
            tracing::debug!(resource = %self.resource, seq, latest = *settled, "Discarding outcome of superseded attempt.");
            return;
        }
        *settled = seq;
        self.status.send_modify(update);
    }

    fn degrade(&self, seq: u64, error: Error) -> Result<Fetched<T>> {
        let served = self
            .last_good
            .lock()
            .clone()
            .map(|value| (value, DataOrigin::LastKnownGood))
            .or_else(|| self.fallback.clone().map(|value| (value, DataOrigin::Fallback)));

        let message = error.to_string();
        self.apply_outcome(seq, |status| {
            status.online = false;
            status.using_fallback = served.is_some();
            status.last_error = Some(message.clone());
            status.consecutive_failures += 1;
        });

        match served {
            Some((value, origin)) => {
                tracing::warn!(resource = %self.resource, error = %message, ?origin, "Upstream unavailable, serving fallback data.");
                Ok(Fetched { value, origin })
            }
            None => {
                tracing::error!(resource = %self.resource, error = %message, "Upstream unavailable and no fallback data.");
                Err(Error::Unavailable {
                    resource: self.resource.clone(),
                    source: Box::new(error),
                })
            }
        }
    }
}

async fn retry_loop<T>(inner: Arc<Inner<T>>, token: CancellationToken)
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    // Errors are reflected in the status; nothing else to do with them here.
    let _ = inner.attempt().await;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(inner.options.retry_interval) => {}
        }
        if !inner.enabled.load(Ordering::SeqCst) {
            return;
        }
        let online = inner.status.borrow().online;
        if online {
            continue;
        }
        tracing::info!(resource = %inner.resource, "Retrying upstream...");
        let _ = inner.attempt().await;
    }
}

/// One-shot fetch with fallback, returning the value and the resulting status.
pub async fn fetch_with_fallback<T>(
    source: Arc<dyn FetchSource>,
    resource: &str,
    fallback: Option<T>,
    options: FallbackOptions,
) -> Result<(Fetched<T>, FallbackStatus)>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    let client = FallbackClient::new(source, resource, fallback, options);
    let fetched = client.fetch_with_fallback().await?;
    Ok((fetched, client.status()))
}
