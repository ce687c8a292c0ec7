//! Beach Pier relay: a public HTTP ingress that forwards requests to tunnel
//! clients over their control WebSockets and relays the replies back.

pub mod affinity;
pub mod completion;
pub mod config;
pub mod connection;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod pending;
pub mod registry;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod verifier;

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::affinity::AffinitySigner;
use crate::config::ServerConfig;
use crate::state::{AppState, SharedState};
use crate::verifier::{CredentialVerifier, RedisVerifier, StaticVerifier};

pub use crate::routes::build_router;

/// Redis when a URL is configured, otherwise the static account list.
pub async fn build_verifier(config: &ServerConfig) -> Result<Arc<dyn CredentialVerifier>> {
    if let Some(redis_url) = &config.redis_url {
        let verifier = RedisVerifier::connect(redis_url)
            .await
            .context("failed to connect to redis")?;
        info!("verifying account keys against redis");
        return Ok(Arc::new(verifier));
    }
    let verifier = StaticVerifier::load(config.accounts_file.as_deref(), &config.accounts)
        .context("failed to load static accounts")?;
    info!(accounts = verifier.len(), "verifying account keys against static list");
    Ok(Arc::new(verifier))
}

pub fn build_state(config: &ServerConfig, verifier: Arc<dyn CredentialVerifier>) -> AppState {
    let affinity = match &config.affinity_secret {
        Some(secret) => AffinitySigner::new(secret.as_bytes().to_vec()),
        None => AffinitySigner::random(),
    };
    AppState::new(verifier, affinity, config.relay.clone())
}

/// Serves the relay on `listener` until `shutdown` resolves. The idle reaper
/// lives exactly as long as the server.
pub async fn serve<F>(listener: TcpListener, state: SharedState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let reaper = state.connections.spawn_reaper(state.settings.idle_timeout);
    let router = build_router(state);
    let outcome = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error");
    reaper.abort();
    outcome
}
