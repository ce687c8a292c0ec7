use std::{sync::Arc, time::Duration};

use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::affinity::AffinitySigner;
use crate::connection::{ConnectionSnapshot, ConnectionTable};
use crate::dispatch::Dispatcher;
use crate::pending::PendingTable;
use crate::registry::{AccountSnapshot, TunnelRegistry};
use crate::verifier::CredentialVerifier;

pub const DEFAULT_MAX_BODY_BYTES: usize = 40 * 1024 * 1024;
pub const DEFAULT_CONNECTION_BUFFER: usize = 256;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Runtime knobs shared by the ingress and the control channel.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// `None` waits for the tunnel client indefinitely.
    pub request_timeout: Option<Duration>,
    pub max_body_bytes: usize,
    pub per_connection_buffer: usize,
    pub idle_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            request_timeout: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            per_connection_buffer: DEFAULT_CONNECTION_BUFFER,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

pub struct AppState {
    pub registry: TunnelRegistry,
    pub connections: ConnectionTable,
    pub dispatcher: Dispatcher,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub affinity: AffinitySigner,
    pub settings: RelaySettings,
    metrics: Option<PrometheusHandle>,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active_connections: usize,
    pub registered_accounts: usize,
    pub pending_requests: usize,
    pub connections: Vec<ConnectionSnapshot>,
    pub accounts: Vec<AccountSnapshot>,
}

impl AppState {
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
        affinity: AffinitySigner,
        settings: RelaySettings,
    ) -> Self {
        let pending = PendingTable::new();
        Self {
            registry: TunnelRegistry::new(),
            connections: ConnectionTable::new(),
            dispatcher: Dispatcher::new(pending, settings.request_timeout),
            verifier,
            affinity,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn pending(&self) -> &PendingTable {
        self.dispatcher.pending()
    }

    pub fn stats(&self) -> StatsResponse {
        StatsResponse {
            active_connections: self.connections.len(),
            registered_accounts: self.registry.len(),
            pending_requests: self.pending().len(),
            connections: self.connections.snapshot(),
            accounts: self.registry.snapshot(),
        }
    }

    /// Prometheus text, or `None` when no recorder was installed.
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}
