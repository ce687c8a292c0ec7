use std::sync::Arc;

use anyhow::{Context, Result};
use beach_pier_server::{
    build_state, build_verifier,
    config::{Cli, ServerConfig},
    serve,
    telemetry::Telemetry,
};
use clap::Parser;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        redis = config.redis_url.is_some(),
        request_timeout_secs = config.relay.request_timeout.map(|t| t.as_secs()),
        "starting beach-pier relay"
    );

    let verifier = build_verifier(&config).await?;
    let state = Arc::new(build_state(&config, verifier).with_metrics(telemetry.metrics_handle()));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-pier listening on {}", config.listen_addr);

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
