use herald_broker::Broker;

use crate::config::{ServeArgs, ServerConfig};
use crate::error::ServerError;

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("herald-server starting");

    // --- Load config ---
    let config = ServerConfig::resolve(&args)?;
    match &args.config {
        Some(path) => tracing::info!(config = %path.display(), "loaded config"),
        None => tracing::info!("no config file, using defaults"),
    }

    // --- Start broker ---
    let broker = Broker::start(config.broker_config()).await?;
    tracing::info!(
        addr = %broker.local_addr(),
        root = %config.storage_root.display(),
        topics = broker.topics().len(),
        "server ready"
    );

    // --- Wait for Ctrl+C ---
    let signal = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down...");

    // Close even if the signal handler failed, then report it.
    broker.close().await;
    signal?;

    tracing::info!("shutdown complete");
    Ok(())
}
