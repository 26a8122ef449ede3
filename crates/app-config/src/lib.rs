// In crates/app-config/src/lib.rs

use config::{Config, Environment, File, FileFormat};
use std::path::Path;

pub mod error;
pub mod types;

// Re-export the most important types for easy access.
pub use error::{Error, Result};
pub use types::{AppSettings, ConnectionSettings, FallbackSettings, Settings};

/// Loads the application settings from the `config/` directory and the environment.
///
/// This function orchestrates the layered configuration loading:
/// 1. Reads from an optional `base.toml` file.
/// 2. Merges settings from an environment-specific file (e.g., `development.toml`).
/// 3. Merges settings from environment variables.
pub fn load_settings() -> Result<Settings> {
    load_settings_from(Path::new("config"))
}

/// Same as [`load_settings`], reading the TOML files from `config_dir`.
pub fn load_settings_from(config_dir: &Path) -> Result<Settings> {
    // Get the current environment. Default to "development" if not set.
    let environment = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "development".into());

    let settings = Config::builder()
        .add_source(File::from(config_dir.join("base")).required(false))
        .add_source(File::from(config_dir.join(&environment)).required(false))
        // Settings from environment variables, e.g. `APP_CONNECTION__URL=...`.
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let settings: Settings = settings.try_deserialize()?;
    settings.validate()?;

    Ok(settings)
}

/// Parses settings from a TOML document, applying defaults for missing keys.
pub fn parse_settings(toml: &str) -> Result<Settings> {
    let settings: Settings = Config::builder()
        .add_source(File::from_str(toml, FileFormat::Toml))
        .build()?
        .try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_match_documented_values() {
        let settings = parse_settings("").unwrap();

        assert_eq!(settings.connection.heartbeat_interval(), Duration::from_millis(30_000));
        assert_eq!(settings.connection.reconnect_delay(), Duration::from_millis(5_000));
        assert_eq!(settings.fallback.retry_interval(), Duration::from_millis(30_000));
        assert_eq!(settings.app.environment, "development");
    }

    #[test]
    fn test_overrides_from_toml() {
        let settings = parse_settings(
            r#"
            [connection]
            url = "ws://dashboard.internal:9000/stream"
            heartbeat_interval_ms = 1000
            max_reconnect_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(settings.connection.heartbeat_interval_ms, 1000);
        assert_eq!(settings.connection.max_reconnect_attempts, 3);
        // Untouched keys keep their defaults.
        assert_eq!(settings.connection.reconnect_delay_ms, 5_000);
        assert_eq!(settings.connection.endpoint().unwrap().port(), Some(9000));
    }

    #[test]
    fn test_secure_upgrade() {
        let mut connection = ConnectionSettings::default();
        connection.secure = true;
        assert_eq!(connection.endpoint().unwrap().scheme(), "wss");

        connection.url = "wss://example.com/ws".into();
        connection.secure = false;
        assert_eq!(connection.endpoint().unwrap().scheme(), "wss");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(matches!(
            parse_settings("[connection]\nurl = \"http://example.com\"").unwrap_err(),
            Error::Invalid(_)
        ));
        assert!(matches!(
            parse_settings("[connection]\nurl = \"not a url\"").unwrap_err(),
            Error::InvalidUrl(_)
        ));
        assert!(matches!(
            parse_settings("[fallback]\nretry_interval_ms = 0").unwrap_err(),
            Error::Invalid(_)
        ));
    }

    #[test]
    fn test_resolve_relative_resource() {
        let fallback = FallbackSettings::default();
        assert_eq!(
            fallback.resolve("/api/agents/status").unwrap().as_str(),
            "http://localhost:8000/api/agents/status"
        );
        assert_eq!(
            fallback.resolve("https://agents.example.com/health").unwrap().as_str(),
            "https://agents.example.com/health"
        );
    }
}
