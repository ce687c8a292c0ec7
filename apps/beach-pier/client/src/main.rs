use std::time::Duration;

use anyhow::{Context, Result};
use beach_pier_client::{connect, ClientConfig, DEFAULT_HEARTBEAT};
use beach_pier_core::{encode_tunnel_path, PortId};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier-client",
    author,
    version,
    about = "Expose local HTTP ports through a Beach Pier relay"
)]
struct Cli {
    /// Relay control endpoint.
    #[arg(
        long,
        env = "BEACH_PIER_RELAY_URL",
        default_value = "ws://127.0.0.1:3007/_pier/connect"
    )]
    relay: String,

    /// Account key presented at registration.
    #[arg(long, env = "BEACH_PIER_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Local port to expose (repeatable).
    #[arg(long = "port", required = true)]
    ports: Vec<PortId>,

    /// Host the local services listen on.
    #[arg(long, env = "BEACH_PIER_LOCAL_HOST", default_value = "127.0.0.1")]
    local_host: String,

    /// Seconds between heartbeats.
    #[arg(long, env = "BEACH_PIER_HEARTBEAT_SECS", default_value_t = DEFAULT_HEARTBEAT.as_secs())]
    heartbeat_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = ClientConfig {
        relay_url: cli.relay,
        api_key: cli.api_key,
        ports: cli.ports,
        local_host: cli.local_host,
        heartbeat: Duration::from_secs(cli.heartbeat_secs.max(1)),
    };

    let tunnel = connect(&config)
        .await
        .with_context(|| format!("failed to register with relay at {}", config.relay_url))?;
    for port in tunnel.ack().ports.iter().flatten() {
        info!(
            "forwarding {} -> http://{}:{port}",
            encode_tunnel_path(&config.api_key, *port, "/"),
            config.local_host
        );
    }

    tunnel
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("relay connection ended")?;
    info!("tunnel closed");
    Ok(())
}
