// In crates/app-config/src/types.rs

use crate::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Settings {
    /// The application's general settings.
    pub app: AppSettings,
    /// Settings for the live dashboard connection.
    pub connection: ConnectionSettings,
    /// Settings for the degraded-mode HTTP fallback.
    pub fallback: FallbackSettings,
}

impl Settings {
    /// Checks the values that cannot be expressed through types alone.
    pub fn validate(&self) -> Result<()> {
        self.connection.endpoint()?;
        Url::parse(&self.fallback.base_url)?;

        let zero_checks = [
            ("connection.heartbeat_interval_ms", self.connection.heartbeat_interval_ms),
            ("connection.reconnect_delay_ms", self.connection.reconnect_delay_ms),
            ("connection.connect_timeout_ms", self.connection.connect_timeout_ms),
            ("fallback.retry_interval_ms", self.fallback.retry_interval_ms),
            ("fallback.request_timeout_ms", self.fallback.request_timeout_ms),
        ];
        for (name, value) in zero_checks {
            if value == 0 {
                return Err(Error::Invalid(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AppSettings {
    /// The environment the application is running in (e.g., "development", "production").
    pub environment: String,
    /// The log level for the application.
    pub log_level: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            environment: "development".into(),
            log_level: "info".into(),
        }
    }
}

/// Settings for the live connection.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ConnectionSettings {
    /// The WebSocket endpoint, e.g. `ws://localhost:8000/ws`.
    pub url: String,
    /// Upgrade a plain `ws://` endpoint to `wss://`.
    pub secure: bool,
    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Consecutive failed connection attempts tolerated before giving up.
    /// Zero disables automatic reconnection.
    pub max_reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws".into(),
            secure: false,
            heartbeat_interval_ms: 30_000,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 5,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ConnectionSettings {
    /// The endpoint to dial, upgraded to `wss` when `secure` is set.
    pub fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        match url.scheme() {
            "wss" => {}
            "ws" if self.secure => {
                url.set_scheme("wss")
                    .map_err(|_| Error::Invalid(format!("cannot upgrade {} to wss", self.url)))?;
            }
            "ws" => {}
            other => {
                return Err(Error::Invalid(format!(
                    "connection.url must use ws or wss, got {other}"
                )));
            }
        }
        Ok(url)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Settings for the fallback/retry façade.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FallbackSettings {
    /// Base URL that relative resources are resolved against.
    pub base_url: String,
    pub retry_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            retry_interval_ms: 30_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl FallbackSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Resolves `resource` against `base_url` unless it is already absolute.
    pub fn resolve(&self, resource: &str) -> Result<Url> {
        match Url::parse(resource) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Url::parse(&self.base_url)?.join(resource)?),
            Err(e) => Err(e.into()),
        }
    }
}
