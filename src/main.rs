//! lineward: a connection-oriented TCP line-protocol server
//!
//! Features:
//! - Newline-delimited text protocol with per-line responses
//! - Proactive liveness polling to catch half-open connections
//! - Thread-safe client registry with broadcast
//! - Configuration via CLI arguments or TOML file

use std::sync::Arc;

use lineward::config::Config;
use lineward::registry::ClientRegistry;
use lineward::resolver::SystemResolver;
use lineward::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        resolve_hostnames = config.resolve_hostnames,
        "Starting lineward server"
    );

    let registry = ClientRegistry::new();
    let server = Server::new(config, registry, Arc::new(SystemResolver));
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    server.stop().await;

    Ok(())
}
