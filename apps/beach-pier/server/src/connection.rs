use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use beach_pier_core::ServerMessage;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::control::ControlState;

/// Identity of one control connection, valid from accept to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Frames queued for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Message(ServerMessage),
    Close(&'static str),
}

#[derive(Debug, thiserror::Error)]
#[error("control connection {0} is closed")]
pub struct ConnectionClosed(pub ConnectionId);

/// Sending half of a control connection. Cheap to clone; all clones feed the
/// same writer task and share the retired flag.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    retired: Arc<AtomicBool>,
}

impl ControlHandle {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            tx,
            retired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Marks the connection dead for routing. Must happen before its pending
    /// requests are failed so a concurrent dispatch either sees the flag or
    /// has its entry swept.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// True once retired or once the writer task has gone away, even if
    /// queued frames are still draining.
    pub fn is_closed(&self) -> bool {
        self.is_retired() || self.tx.is_closed()
    }

    pub async fn send(&self, message: ServerMessage) -> Result<(), ConnectionClosed> {
        self.tx
            .send(Outbound::Message(message))
            .await
            .map_err(|_| ConnectionClosed(self.id))
    }

    /// Best effort; a full queue means the peer is not reading anyway.
    pub fn close(&self, reason: &'static str) {
        match self.tx.try_send(Outbound::Close(reason)) {
            Ok(()) | Err(TrySendError::Closed(_)) | Err(TrySendError::Full(_)) => {}
        }
    }
}

struct ConnectionEntry {
    handle: ControlHandle,
    state: parking_lot::RwLock<ControlState>,
    remote_addr: Option<SocketAddr>,
    connected_at: u64,
    last_seen: AtomicU64,
    shutdown: CancellationToken,
}

/// Live control connections keyed by identity.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<DashMap<ConnectionId, ConnectionEntry>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub connection_id: ConnectionId,
    pub state: ControlState,
    pub remote_addr: Option<String>,
    pub connected_at_ms: u64,
    pub idle_ms: u64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a freshly accepted connection and returns the token that is
    /// cancelled when the connection is evicted.
    pub fn insert(&self, handle: ControlHandle, remote_addr: Option<SocketAddr>) -> CancellationToken {
        let now = now_millis();
        let shutdown = CancellationToken::new();
        self.inner.insert(
            handle.id(),
            ConnectionEntry {
                handle,
                state: parking_lot::RwLock::new(ControlState::Connected),
                remote_addr,
                connected_at: now,
                last_seen: AtomicU64::new(now),
                shutdown: shutdown.clone(),
            },
        );
        counter!("beach_pier_connections_total", 1);
        gauge!("beach_pier_connections_active", self.inner.len() as f64);
        shutdown
    }

    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.inner.remove(&id).is_some();
        if removed {
            gauge!("beach_pier_connections_active", self.inner.len() as f64);
        }
        removed
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.contains_key(&id)
    }

    pub fn set_state(&self, id: ConnectionId, state: ControlState) {
        if let Some(entry) = self.inner.get(&id) {
            *entry.state.write() = state;
        }
    }

    pub fn state(&self, id: ConnectionId) -> Option<ControlState> {
        self.inner.get(&id).map(|entry| entry.state.read().clone())
    }

    pub fn touch(&self, id: ConnectionId) {
        if let Some(entry) = self.inner.get(&id) {
            entry.last_seen.store(now_millis(), Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Cancels every connection whose last frame is older than `idle_timeout`.
    /// The socket tasks observe the cancellation and run their normal
    /// disconnect path.
    pub fn evict_idle(&self, now: u64, idle_timeout: Duration) -> usize {
        let limit = idle_timeout.as_millis() as u64;
        let mut evicted = 0usize;
        for entry in self.inner.iter() {
            let last = entry.last_seen.load(Ordering::Relaxed);
            if now.saturating_sub(last) > limit && !entry.shutdown.is_cancelled() {
                info!(
                    connection_id = %entry.key(),
                    idle_ms = now.saturating_sub(last),
                    "closing idle control connection"
                );
                entry.handle.close("idle timeout");
                entry.shutdown.cancel();
                evicted += 1;
            }
        }
        if evicted > 0 {
            counter!("beach_pier_idle_evictions_total", evicted as u64);
        }
        evicted
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let now = now_millis();
        self.inner
            .iter()
            .map(|entry| ConnectionSnapshot {
                connection_id: *entry.key(),
                state: entry.state.read().clone(),
                remote_addr: entry.remote_addr.map(|addr| addr.to_string()),
                connected_at_ms: entry.connected_at,
                idle_ms: now.saturating_sub(entry.last_seen.load(Ordering::Relaxed)),
            })
            .collect()
    }

    pub fn spawn_reaper(&self, idle_timeout: Duration) -> JoinHandle<()> {
        let table = self.clone();
        let period = (idle_timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(30));
        let mut interval = tokio::time::interval(period);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let _ = table.evict_idle(now_millis(), idle_timeout);
            }
        })
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ControlHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(4);
        (ControlHandle::new(ConnectionId::new(), tx), rx)
    }

    #[test_timeout::timeout]
    fn insert_and_remove_track_membership() {
        let table = ConnectionTable::new();
        let (handle, _rx) = handle();
        let id = handle.id();
        table.insert(handle, None);
        assert!(table.contains(id));
        assert_eq!(table.state(id), Some(ControlState::Connected));
        assert!(table.remove(id));
        assert!(!table.contains(id));
        assert!(!table.remove(id));
    }

    #[test_timeout::timeout]
    fn evict_idle_cancels_stale_connections_only() {
        let table = ConnectionTable::new();
        let (stale, mut stale_rx) = handle();
        let (fresh, _fresh_rx) = handle();
        let stale_token = table.insert(stale.clone(), None);
        let fresh_token = table.insert(fresh.clone(), None);

        let now = now_millis() + 10_000;
        table.touch(fresh.id());
        if let Some(entry) = table.inner.get(&fresh.id()) {
            entry.last_seen.store(now, Ordering::Relaxed);
        }

        assert_eq!(table.evict_idle(now, Duration::from_secs(5)), 1);
        assert!(stale_token.is_cancelled());
        assert!(!fresh_token.is_cancelled());
        assert!(matches!(stale_rx.try_recv(), Ok(Outbound::Close("idle timeout"))));

        // Already-cancelled connections are not counted twice.
        assert_eq!(table.evict_idle(now, Duration::from_secs(5)), 0);
    }

    #[test_timeout::timeout]
    fn retired_handle_reads_closed_for_every_clone() {
        let (handle, _rx) = handle();
        let clone = handle.clone();
        assert!(!clone.is_closed());
        handle.retire();
        assert!(clone.is_retired());
        assert!(clone.is_closed());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn send_fails_once_writer_is_gone() {
        let (handle, rx) = handle();
        drop(rx);
        assert!(handle.is_closed());
        assert!(handle.send(ServerMessage::Pong).await.is_err());
    }
}
