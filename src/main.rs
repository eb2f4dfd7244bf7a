//! Turn Relay Server
//!
//! Binds the configured address and relays moves between two participants
//! until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use turn_relay::{RelayConfig, RelayServer, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Turn Relay v{}", VERSION);

    let config = RelayConfig::from_env();
    info!("Bind address: {}", config.bind_addr);
    info!("Max message size: {} bytes", config.max_message_size);

    let server = Arc::new(RelayServer::new(config));
    let runner = server.clone();
    let mut serve = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut serve => {
            result.context("Server task panicked")??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Stop requested");
        }
    }

    server.shutdown();
    serve.await.context("Server task panicked")??;
    Ok(())
}
