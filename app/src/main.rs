// In app/src/main.rs

use anyhow::{Context, Result};
use api_client::{ConnectionState, FallbackOptions, HttpSource, fetch_with_fallback};
use app_config::Settings;
use clap::{Parser, Subcommand};
use engine::Session;
use std::str::FromStr;
use std::sync::Arc;
use store::StoreState;
use tracing_subscriber::prelude::*;

// --- Command-Line Interface Definition ---

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = "Live data client for the trading dashboard.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connects to the live feed and mirrors it into the store until Ctrl-C.
    Run,

    /// Fetches one HTTP resource, degrading to fallback data if it is unreachable.
    Fetch {
        /// Resource path relative to `fallback.base_url` (e.g. "/api/agents/status"), or an absolute URL.
        resource: String,

        /// JSON document to serve if the resource cannot be fetched.
        #[arg(long)]
        fallback: Option<String>,
    },
}

// --- Main Application Entry Point ---

#[tokio::main]
async fn main() -> Result<()> {
    // Parsed first so `--help` and usage errors never depend on the config.
    let cli = Cli::parse();

    // Load environment variables from a .env file, if it exists.
    dotenvy::dotenv().ok();

    let settings = app_config::load_settings().context("Failed to load settings")?;
    init_tracing(&settings.app.log_level);

    tracing::info!(environment = %settings.app.environment, "Starting dashboard client");

    match cli.command {
        Commands::Run => run_session(settings).await?,
        Commands::Fetch { resource, fallback } => handle_fetch(settings, resource, fallback).await?,
    }

    tracing::info!("Dashboard client has finished successfully.");
    Ok(())
}

fn init_tracing(log_level: &str) {
    let level = tracing::Level::from_str(log_level).unwrap_or(tracing::Level::INFO);
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(
        tracing_subscriber::filter::Targets::new()
            .with_target("tungstenite", tracing::Level::WARN)
            .with_target("tokio_tungstenite", tracing::Level::WARN)
            .with_default(level),
    );
    tracing_subscriber::registry().with(fmt_layer).init();
}

// --- "Run" Subcommand Logic ---

async fn run_session(settings: Settings) -> Result<()> {
    let session = Session::create(settings)?;

    let _subscription = session.store().subscribe(|state| log_summary(state));

    let mut states = session.subscribe_state();
    let watcher = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            if state == ConnectionState::Error {
                tracing::error!("Live feed unavailable; reconnect attempts exhausted. Press Ctrl-C to exit.");
            }
        }
    });

    session.start();
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    tracing::info!("Ctrl-C received, shutting down.");

    session.teardown().await;
    watcher.abort();

    let stats = session.dispatcher().stats();
    tracing::info!(
        routed = stats.routed(),
        rejected = stats.rejected(),
        unhandled = stats.unhandled(),
        heartbeats = session.connection().stats().heartbeats_sent(),
        "Session closed."
    );
    Ok(())
}

fn log_summary(state: &StoreState) {
    tracing::debug!(
        generation = state.generation,
        accounts = state.accounts.len(),
        open_positions = state.open_positions().count(),
        prices = state.prices.len(),
        degraded_services = state.degraded_services().count(),
        "Store updated."
    );
}

// --- "Fetch" Subcommand Logic ---

async fn handle_fetch(settings: Settings, resource: String, fallback: Option<String>) -> Result<()> {
    let fallback: Option<serde_json::Value> = fallback
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .context("--fallback must be valid JSON")?;

    let source = HttpSource::new(&settings.fallback)?;
    let (fetched, status) = fetch_with_fallback(
        Arc::new(source),
        &resource,
        fallback,
        FallbackOptions::from_settings(&settings.fallback),
    )
    .await?;

    if fetched.is_live() {
        tracing::info!(%resource, "Fetched live data.");
    } else {
        tracing::warn!(%resource, origin = ?fetched.origin, error = ?status.last_error, "Serving fallback data.");
    }
    println!("{}", serde_json::to_string_pretty(&fetched.value)?);
    Ok(())
}
