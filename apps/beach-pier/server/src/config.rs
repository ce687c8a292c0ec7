use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::state::{RelaySettings, DEFAULT_CONNECTION_BUFFER, DEFAULT_MAX_BODY_BYTES};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub accounts_file: Option<PathBuf>,
    pub accounts: Vec<String>,
    pub affinity_secret: Option<String>,
    pub shutdown_grace: Duration,
    pub relay: RelaySettings,
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier-server",
    author,
    version,
    about = "Public relay that forwards HTTP traffic to tunnel clients over WebSockets"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "0.0.0.0:3007")]
    pub listen_addr: String,

    /// Redis URI holding `pier:account:<api_key>` records. Takes precedence
    /// over static accounts.
    #[arg(long, env = "BEACH_PIER_REDIS_URL")]
    pub redis_url: Option<String>,

    /// TOML file with `[[accounts]]` tables.
    #[arg(long, env = "BEACH_PIER_ACCOUNTS_FILE")]
    pub accounts_file: Option<PathBuf>,

    /// Account key accepted in addition to the accounts file (repeatable).
    #[arg(long = "account", env = "BEACH_PIER_ACCOUNTS", value_delimiter = ',')]
    pub accounts: Vec<String>,

    /// Seconds to wait for a tunnel client's response; 0 waits forever.
    #[arg(long, env = "BEACH_PIER_REQUEST_TIMEOUT_SECS", default_value_t = 0)]
    pub request_timeout_secs: u64,

    /// Upper bound for ingress bodies and control frames.
    #[arg(long, env = "BEACH_PIER_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Outbound frames queued per control connection.
    #[arg(long, env = "BEACH_PIER_CONNECTION_BUFFER", default_value_t = DEFAULT_CONNECTION_BUFFER)]
    pub per_connection_buffer: usize,

    /// Control connections silent for longer than this are closed.
    #[arg(long, env = "BEACH_PIER_IDLE_TIMEOUT_SECS", default_value_t = 600)]
    pub idle_timeout_secs: u64,

    /// Key for affinity cookie MACs. Random per process when unset.
    #[arg(long, env = "BEACH_PIER_AFFINITY_SECRET", hide_env_values = true)]
    pub affinity_secret: Option<String>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.per_connection_buffer == 0 {
            bail!("per-connection buffer must be at least 1");
        }
        if cli.idle_timeout_secs == 0 {
            bail!("idle timeout must be at least one second");
        }
        if cli
            .affinity_secret
            .as_deref()
            .is_some_and(|secret| secret.is_empty())
        {
            bail!("affinity secret must not be empty");
        }

        Ok(ServerConfig {
            listen_addr,
            redis_url: cli.redis_url.filter(|url| !url.is_empty()),
            accounts_file: cli.accounts_file,
            accounts: cli.accounts.into_iter().filter(|key| !key.is_empty()).collect(),
            affinity_secret: cli.affinity_secret,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            relay: RelaySettings {
                request_timeout: (cli.request_timeout_secs > 0)
                    .then(|| Duration::from_secs(cli.request_timeout_secs)),
                max_body_bytes: cli.max_body_bytes,
                per_connection_buffer: cli.per_connection_buffer,
                idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
            },
        })
    }
}
