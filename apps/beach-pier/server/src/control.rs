//! Control-channel lifecycle: one WebSocket per tunnel client.
//!
//! A connection starts `Connected`, becomes `Registered` once the verifier
//! accepts its account key, and ends `Disconnected`. Leaving the table, the
//! registry binding, and any pending requests all happen on that last
//! transition, whichever way the socket went away.

use std::{mem, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use beach_pier_core::{ClientMessage, PortId, PortRegisterAck, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::completion;
use crate::connection::{ConnectionId, ConnectionTable, ControlHandle, Outbound};
use crate::pending::PendingTable;
use crate::registry::TunnelRegistry;
use crate::state::SharedState;
use crate::verifier::CredentialVerifier;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ControlState {
    Connected,
    Registered {
        #[serde(skip_serializing)]
        api_key: String,
        ports: Vec<PortId>,
    },
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("register ports before sending responses")]
    NotRegistered,
    #[error("control connection is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Server-side view of a single control connection.
pub struct ControlChannel {
    handle: ControlHandle,
    state: ControlState,
    registry: TunnelRegistry,
    connections: ConnectionTable,
    pending: PendingTable,
    verifier: Arc<dyn CredentialVerifier>,
}

impl ControlChannel {
    /// Enters the connection table in `Connected`. The returned token fires
    /// when the relay wants the socket closed (idle eviction).
    pub fn open(
        state: &SharedState,
        handle: ControlHandle,
        remote_addr: Option<SocketAddr>,
    ) -> (Self, CancellationToken) {
        let shutdown = state.connections.insert(handle.clone(), remote_addr);
        let channel = Self {
            handle,
            state: ControlState::Connected,
            registry: state.registry.clone(),
            connections: state.connections.clone(),
            pending: state.pending().clone(),
            verifier: Arc::clone(&state.verifier),
        };
        (channel, shutdown)
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    fn transition(&mut self, next: ControlState) -> Result<(), TransitionError> {
        if self.state == ControlState::Disconnected {
            return Err(TransitionError::Closed);
        }
        self.connections.set_state(self.id(), next.clone());
        self.state = next;
        Ok(())
    }

    async fn send(&self, message: ServerMessage) -> Result<(), TransitionError> {
        self.handle
            .send(message)
            .await
            .map_err(|_| TransitionError::Closed)
    }

    pub async fn send_error(&self, message: String) -> Result<(), TransitionError> {
        self.send(ServerMessage::Error { message }).await
    }

    /// Parses one text or binary frame and applies it.
    pub async fn handle_payload(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let message: ClientMessage = serde_json::from_slice(payload)?;
        self.handle_message(message).await?;
        Ok(())
    }

    pub async fn handle_message(&mut self, message: ClientMessage) -> Result<(), TransitionError> {
        match message {
            ClientMessage::RegisterPorts { api_key, ports } => self.register(api_key, ports).await,
            ClientMessage::Response(response) => match self.state {
                ControlState::Registered { .. } => {
                    completion::complete(&self.pending, self.id(), response);
                    Ok(())
                }
                ControlState::Connected => Err(TransitionError::NotRegistered),
                ControlState::Disconnected => Err(TransitionError::Closed),
            },
            ClientMessage::Ping => {
                if self.state == ControlState::Disconnected {
                    return Err(TransitionError::Closed);
                }
                self.connections.touch(self.id());
                self.send(ServerMessage::Pong).await
            }
        }
    }

    async fn register(&mut self, api_key: String, ports: Vec<PortId>) -> Result<(), TransitionError> {
        if self.state == ControlState::Disconnected {
            return Err(TransitionError::Closed);
        }
        let connection_id = self.id();

        let lookup = if api_key.is_empty() {
            Ok(None)
        } else {
            self.verifier.lookup(&api_key).await
        };

        let ack = match lookup {
            Ok(Some(_record)) => {
                if let ControlState::Registered {
                    api_key: previous, ..
                } = &self.state
                {
                    if *previous != api_key {
                        self.registry.release(previous, connection_id);
                    }
                }
                let stored = self
                    .registry
                    .register_ports(&api_key, ports, self.handle.clone());
                self.transition(ControlState::Registered {
                    api_key: api_key.clone(),
                    ports: stored.clone(),
                })?;
                counter!("beach_pier_registrations_total", 1, "outcome" => "accepted");
                info!(%connection_id, %api_key, ports = ?stored, "ports registered");
                PortRegisterAck::accepted(api_key, stored)
            }
            Ok(None) => {
                counter!("beach_pier_registrations_total", 1, "outcome" => "rejected");
                warn!(%connection_id, %api_key, "registration rejected: unknown api key");
                PortRegisterAck::rejected("unknown api key")
            }
            Err(err) => {
                counter!("beach_pier_registrations_total", 1, "outcome" => "error");
                warn!(%connection_id, %api_key, error = %err, "credential lookup failed");
                PortRegisterAck::rejected("verifier unavailable")
            }
        };
        self.send(ServerMessage::PortRegisterAck(ack)).await
    }

    /// Idempotent. Returns `false` if the connection was already closed.
    pub fn disconnect(&mut self) -> bool {
        let previous = mem::replace(&mut self.state, ControlState::Disconnected);
        if previous == ControlState::Disconnected {
            return false;
        }
        let connection_id = self.id();
        self.handle.retire();
        self.connections.remove(connection_id);
        let released = self.registry.unbind(connection_id);
        let failed = self.pending.fail_connection(connection_id);
        counter!("beach_pier_disconnects_total", 1);
        info!(
            %connection_id,
            released = ?released,
            failed_requests = failed,
            "control connection disconnected"
        );
        true
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Headroom for envelope fields and headers around a base64 body.
const ENVELOPE_OVERHEAD: usize = 64 * 1024;

/// Largest control frame accepted for a given body limit. Bodies travel as
/// base64, which inflates them by a third.
pub fn control_frame_limit(max_body_bytes: usize) -> usize {
    max_body_bytes
        .div_ceil(3)
        .saturating_mul(4)
        .saturating_add(ENVELOPE_OVERHEAD)
}

pub async fn websocket_handler(
    State(state): State<SharedState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    let limit = control_frame_limit(state.settings.max_body_bytes);
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: SharedState, remote_addr: Option<SocketAddr>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel(state.settings.per_connection_buffer.max(1));
    let handle = ControlHandle::new(ConnectionId::new(), tx);
    let (mut channel, shutdown) = ControlChannel::open(&state, handle, remote_addr);
    let connection_id = channel.id();
    info!(%connection_id, remote_addr = ?remote_addr, "control connection established");

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let frame = match outbound {
                Outbound::Message(message) => match serde_json::to_string(&message) {
                    Ok(text) => Message::Text(text),
                    Err(err) => {
                        warn!(%connection_id, error = %err, "failed to encode control message");
                        continue;
                    }
                },
                Outbound::Close(reason) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
        debug!(%connection_id, "writer task finished");
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let payload = match frame {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(frame))) => {
                info!(
                    %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed control connection"
                );
                break;
            }
            Some(Ok(_)) => {
                state.connections.touch(connection_id);
                continue;
            }
            Some(Err(err)) => {
                warn!(%connection_id, error = %err, "error receiving control frame");
                break;
            }
            None => break,
        };

        state.connections.touch(connection_id);
        match channel.handle_payload(&payload).await {
            Ok(()) => {}
            Err(ProtocolError::Transition(TransitionError::Closed)) => break,
            Err(err) => {
                counter!("beach_pier_protocol_errors_total", 1);
                warn!(%connection_id, error = %err, "rejecting control frame");
                if channel.send_error(err.to_string()).await.is_err() {
                    break;
                }
            }
        }
    }

    channel.disconnect();
    drop(channel);
    if tokio::time::timeout(Duration::from_secs(1), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}
