use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use beach_pier_core::{PortId, ResponseEnvelope};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::connection::ConnectionId;
use crate::error::DispatchError;

struct PendingEntry {
    connection: ConnectionId,
    api_key: String,
    port: PortId,
    created_at: Instant,
    reply: oneshot::Sender<ResponseEnvelope>,
}

/// In-flight requests awaiting a Response Envelope, keyed by request id.
/// Removal is the only way to reach the reply channel, so a request can be
/// completed at most once.
#[derive(Clone, Default)]
pub struct PendingTable {
    inner: Arc<DashMap<Uuid, PendingEntry>>,
}

/// Outcome of feeding a Response Envelope into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Delivered,
    /// Unknown, already completed, or owned by another connection.
    Stale,
    /// The entry existed but the caller had already gone away.
    CallerGone,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        request_id: Uuid,
        connection: ConnectionId,
        api_key: &str,
        port: PortId,
    ) -> Result<PendingResponse, DispatchError> {
        let (reply, rx) = oneshot::channel();
        match self.inner.entry(request_id) {
            Entry::Occupied(_) => return Err(DispatchError::DuplicateRequestId),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    connection,
                    api_key: api_key.to_string(),
                    port,
                    created_at: Instant::now(),
                    reply,
                });
            }
        }
        Ok(PendingResponse {
            request_id,
            rx,
            table: self.clone(),
        })
    }

    /// Destructively takes the entry for `response.request_id` if it was
    /// dispatched over `from`, and hands the envelope to the waiting caller.
    pub fn complete(&self, from: ConnectionId, response: ResponseEnvelope) -> Completion {
        let Some((_, entry)) = self
            .inner
            .remove_if(&response.request_id, |_, entry| entry.connection == from)
        else {
            return Completion::Stale;
        };
        tracing::trace!(
            request_id = %response.request_id,
            api_key = %entry.api_key,
            port = entry.port,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "completing pending request"
        );
        match entry.reply.send(response) {
            Ok(()) => Completion::Delivered,
            Err(_) => Completion::CallerGone,
        }
    }

    /// Drops every entry dispatched over `connection`; their callers observe a
    /// closed channel.
    pub fn fail_connection(&self, connection: ConnectionId) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, entry| entry.connection != connection);
        before.saturating_sub(self.inner.len())
    }

    pub fn contains(&self, request_id: &Uuid) -> bool {
        self.inner.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Caller-side half of a pending entry. Dropping it (caller disconnect,
/// timeout, or completion) purges whatever is left of the entry.
pub struct PendingResponse {
    request_id: Uuid,
    rx: oneshot::Receiver<ResponseEnvelope>,
    table: PendingTable,
}

impl PendingResponse {
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<ResponseEnvelope, DispatchError> {
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, &mut self.rx)
                .await
                .map_err(|_| DispatchError::TimedOut)?,
            None => (&mut self.rx).await,
        };
        received.map_err(|_| DispatchError::ConnectionLost)
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.table.inner.remove(&self.request_id);
    }
}
