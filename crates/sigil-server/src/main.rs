//! # Sigil Relay
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! sigil-relay
//!
//! # Run with custom config
//! sigil-relay --config /path/to/sigil.toml
//!
//! # Run with environment variables
//! SIGIL_PORT=8080 SIGIL_HOST=0.0.0.0 sigil-relay
//! ```

use anyhow::Result;
use sigil_server::{config::Config, handlers, metrics};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sigil=debug,sigil_server=debug,sigil_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from);
    let config = Config::load(path.as_deref())?;

    tracing::info!("Starting sigil relay on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
