use std::sync::Arc;

use beach_pier_core::PortId;
use dashmap::DashMap;
use serde::Serialize;

use crate::connection::{ConnectionId, ControlHandle};
use crate::error::RouteError;

/// Per-account tunnel state: the exposed ports and, while the owning client is
/// online, the control connection bound to them.
#[derive(Debug, Clone)]
struct AccountEntry {
    ports: Vec<PortId>,
    connection: Option<ControlHandle>,
}

/// Tunnel registry keyed by account key. DashMap shards serialize writers per
/// key, so registrations for unrelated accounts never contend on one lock.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    accounts: Arc<DashMap<String, AccountEntry>>,
}

/// Account keys are credentials and never leave the process.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub ports: Vec<PortId>,
    pub connection_id: Option<ConnectionId>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the account's ports and binding. Last write wins; the
    /// returned list is the stored, de-duplicated port set.
    pub fn register_ports(
        &self,
        api_key: &str,
        ports: Vec<PortId>,
        connection: ControlHandle,
    ) -> Vec<PortId> {
        let mut unique = Vec::with_capacity(ports.len());
        for port in ports {
            if !unique.contains(&port) {
                unique.push(port);
            }
        }
        self.accounts.insert(
            api_key.to_string(),
            AccountEntry {
                ports: unique.clone(),
                connection: Some(connection),
            },
        );
        unique
    }

    pub fn resolve_connection(&self, api_key: &str) -> Result<ControlHandle, RouteError> {
        let entry = self
            .accounts
            .get(api_key)
            .ok_or(RouteError::UnknownAccount)?;
        match &entry.connection {
            Some(handle) if !handle.is_closed() => Ok(handle.clone()),
            _ => Err(RouteError::NoLiveConnection),
        }
    }

    pub fn port_allowed(&self, api_key: &str, port: PortId) -> bool {
        self.accounts
            .get(api_key)
            .is_some_and(|entry| entry.ports.contains(&port))
    }

    /// Full routing contract: the account must exist, expose at least one port,
    /// expose `port`, and be bound to a live connection.
    pub fn resolve(&self, api_key: &str, port: PortId) -> Result<ControlHandle, RouteError> {
        let entry = self
            .accounts
            .get(api_key)
            .ok_or(RouteError::UnknownAccount)?;
        if entry.ports.is_empty() {
            return Err(RouteError::NoPorts);
        }
        if !entry.ports.contains(&port) {
            return Err(RouteError::PortNotRegistered(port));
        }
        match &entry.connection {
            Some(handle) if !handle.is_closed() => Ok(handle.clone()),
            _ => Err(RouteError::NoLiveConnection),
        }
    }

    /// Clears `api_key`'s binding if it still points at `connection`.
    pub fn release(&self, api_key: &str, connection: ConnectionId) -> bool {
        match self.accounts.get_mut(api_key) {
            Some(mut entry) if bound_to(&entry, connection) => {
                entry.connection = None;
                true
            }
            _ => false,
        }
    }

    /// Invalidates every binding that points at a dead connection and returns
    /// the affected account keys.
    pub fn unbind(&self, connection: ConnectionId) -> Vec<String> {
        let mut released = Vec::new();
        for mut entry in self.accounts.iter_mut() {
            if bound_to(&entry, connection) {
                entry.connection = None;
                released.push(entry.key().clone());
            }
        }
        released
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn snapshot(&self) -> Vec<AccountSnapshot> {
        self.accounts
            .iter()
            .map(|entry| AccountSnapshot {
                ports: entry.ports.clone(),
                connection_id: entry.connection.as_ref().map(ControlHandle::id),
            })
            .collect()
    }
}

fn bound_to(entry: &AccountEntry, connection: ConnectionId) -> bool {
    entry
        .connection
        .as_ref()
        .is_some_and(|handle| handle.id() == connection)
}
