use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use frequency_relay::{abuse, config::RelayConfig, state::Relay};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "frequency_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting frequency relay...");

    let config = RelayConfig::from_env();
    let addr = config.bind_addr;

    let relay = Arc::new(Relay::new(config));
    abuse::spawn_rate_limit_janitor(relay.clone());

    let app = frequency_relay::app(relay);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("Failed to bind {}: {}", addr, e);
        e
    })?;
    tracing::info!("Listening on ws://{}/ws", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
