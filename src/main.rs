mod config;
mod error;
mod platform;
mod relay;
mod server;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{http_client, Config};
use crate::platform::line::LinePushClient;
use crate::relay::Relay;
use crate::store::selector::BackendSelection;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,line_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Pick the store once; no fallback at runtime
    let selection = BackendSelection::from_env().context("Failed to select message store")?;
    let store = selection
        .open(&config.storage)
        .with_context(|| format!("Failed to open {} store", selection.name()))?;

    if config.line.channel_access_token.is_empty() {
        warn!("No LINE channel access token configured; sending will fail");
    }
    let push = LinePushClient::new(http_client(config.storage.timeout())?, &config.line);

    info!("Configuration loaded successfully");
    info!("  Store: {}", selection.name());
    info!("  Dispatch order: {}", config.dispatch.order);
    info!("  Bind: {}", config.server.bind);

    let relay = Arc::new(Relay::new(store, Arc::new(push), config.dispatch.order));

    server::serve(relay, &config.server.bind).await
}
