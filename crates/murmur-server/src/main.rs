//! # Murmur Server
//!
//! Real-time presence and messaging relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! murmur
//!
//! # Run with a specific config file
//! MURMUR_CONFIG=/path/to/murmur.toml murmur
//!
//! # Run with environment variables
//! MURMUR_PORT=7000 MURMUR_HOST=0.0.0.0 murmur
//! ```

mod config;
mod connection;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        "Starting Murmur relay (tcp {}:{}, websocket port {})",
        config.host,
        config.port,
        config.transport.websocket_port
    );

    // Initialize metrics
    metrics::init_metrics();

    tokio::select! {
        result = handlers::run_server(config) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
