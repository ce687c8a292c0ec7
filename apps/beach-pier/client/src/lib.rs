//! Tunnel client: registers local ports with a Beach Pier relay and replays
//! every delivered request against `http://<local_host>:<port>`.

use std::{future::Future, time::Duration};

use beach_pier_core::{
    ClientMessage, HeaderMap, OneOrMany, PortId, PortRegisterAck, RequestEnvelope,
    ResponseEnvelope, ServerMessage,
};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc, time::Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Request headers the local service must not see verbatim: the host belongs
/// to the relay, the body is re-framed, and responses travel uncompressed.
const SKIPPED_REQUEST_HEADERS: [&str; 3] = ["host", "content-length", "accept-encoding"];

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
    pub api_key: String,
    pub ports: Vec<PortId>,
    pub local_host: String,
    pub heartbeat: Duration,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("relay connection failed: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("relay rejected registration: {0}")]
    Rejected(String),
    #[error("relay did not acknowledge registration")]
    RegistrationTimedOut,
    #[error("relay closed the connection")]
    Closed,
    #[error("malformed relay message: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid method {0:?}")]
    InvalidMethod(String),
    #[error("request body is not valid base64: {0}")]
    Body(#[from] base64::DecodeError),
    #[error("local service unreachable: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// Replays Request Envelopes against the local machine.
#[derive(Debug, Clone)]
pub struct Forwarder {
    http: reqwest::Client,
    local_host: String,
}

impl Forwarder {
    pub fn new(local_host: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            local_host: local_host.into(),
        })
    }

    pub fn target_url(&self, request: &RequestEnvelope) -> String {
        let mut url = format!("http://{}:{}{}", self.local_host, request.port, request.path);
        if let Some(query) = request.query_string() {
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    /// Never fails: local errors become a 502 carrying the error text.
    pub async fn forward(&self, request: RequestEnvelope) -> ResponseEnvelope {
        match self.try_forward(&request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(request_id = %request.request_id, port = request.port, error = %err, "local forward failed");
                ResponseEnvelope::new(request.request_id, 502)
                    .with_header("content-type", "text/plain; charset=utf-8")
                    .with_body(err.to_string().as_bytes())
            }
        }
    }

    async fn try_forward(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope, ForwardError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ForwardError::InvalidMethod(request.method.clone()))?;
        let mut builder = self.http.request(method, self.target_url(request));
        for (name, values) in &request.headers {
            if SKIPPED_REQUEST_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            for value in values.values() {
                builder = builder.header(name.as_str(), value);
            }
        }
        let response = builder.body(request.decode_body()?).send().await?;

        let status = response.status().as_u16();
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            match headers.get_mut(name.as_str()) {
                Some(existing) => existing.push(value),
                None => {
                    headers.insert(name.as_str().to_string(), OneOrMany::One(value));
                }
            }
        }
        let body = response.bytes().await?;
        debug!(request_id = %request.request_id, status, bytes = body.len(), "local forward completed");

        let mut envelope = ResponseEnvelope::new(request.request_id, status).with_body(&body);
        envelope.headers = headers;
        Ok(envelope)
    }
}

/// A control connection whose registration the relay has accepted.
pub struct RegisteredTunnel {
    socket: RelaySocket,
    ack: PortRegisterAck,
    forwarder: Forwarder,
    heartbeat: Duration,
}

/// Connects to the relay and registers `config.ports` under `config.api_key`.
pub async fn connect(config: &ClientConfig) -> Result<RegisteredTunnel, ClientError> {
    let forwarder = Forwarder::new(config.local_host.clone())?;
    let (mut socket, _) = connect_async(config.relay_url.as_str()).await?;

    let register = ClientMessage::RegisterPorts {
        api_key: config.api_key.clone(),
        ports: config.ports.clone(),
    };
    socket
        .send(Message::Text(serde_json::to_string(&register)?))
        .await?;

    let ack = tokio::time::timeout(REGISTRATION_TIMEOUT, wait_for_ack(&mut socket))
        .await
        .map_err(|_| ClientError::RegistrationTimedOut)??;
    if !ack.ack {
        let reason = ack.message.unwrap_or_else(|| "registration refused".into());
        let _ = socket.close(None).await;
        return Err(ClientError::Rejected(reason));
    }
    info!(api_key = %config.api_key, ports = ?ack.ports, "tunnel registered");

    Ok(RegisteredTunnel {
        socket,
        ack,
        forwarder,
        heartbeat: config.heartbeat,
    })
}

async fn wait_for_ack(socket: &mut RelaySocket) -> Result<PortRegisterAck, ClientError> {
    while let Some(frame) = socket.next().await {
        let message = match frame? {
            Message::Text(text) => serde_json::from_str::<ServerMessage>(&text)?,
            Message::Binary(bytes) => serde_json::from_slice::<ServerMessage>(&bytes)?,
            Message::Close(_) => break,
            _ => continue,
        };
        match message {
            ServerMessage::PortRegisterAck(ack) => return Ok(ack),
            ServerMessage::Error { message } => warn!(%message, "relay reported an error"),
            other => debug!(?other, "ignoring message before registration ack"),
        }
    }
    Err(ClientError::Closed)
}

impl RegisteredTunnel {
    pub fn ack(&self) -> &PortRegisterAck {
        &self.ack
    }

    /// Serves relay traffic until the relay goes away or `shutdown` resolves.
    /// Each request runs on its own task so slow local handlers do not block
    /// the rest.
    pub async fn run<F>(self, shutdown: F) -> Result<(), ClientError>
    where
        F: Future<Output = ()>,
    {
        let (mut sink, mut stream) = self.socket.split();
        let (tx, mut rx) = mpsc::channel::<ClientMessage>(64);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode client message");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let heartbeat_tx = tx.clone();
        let period = self.heartbeat;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).await.is_err() {
                    break;
                }
            }
        });

        tokio::pin!(shutdown);
        let outcome = loop {
            let frame = tokio::select! {
                _ = &mut shutdown => break Ok(()),
                frame = stream.next() => frame,
            };
            let message = match frame {
                Some(Ok(Message::Text(text))) => serde_json::from_str::<ServerMessage>(&text),
                Some(Ok(Message::Binary(bytes))) => serde_json::from_slice::<ServerMessage>(&bytes),
                Some(Ok(Message::Close(_))) | None => break Err(ClientError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(err)) => break Err(err.into()),
            };
            let message = match message {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "ignoring malformed relay message");
                    continue;
                }
            };
            match message {
                ServerMessage::Request(request) => {
                    let forwarder = self.forwarder.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let response = forwarder.forward(request).await;
                        let _ = tx.send(ClientMessage::Response(response)).await;
                    });
                }
                ServerMessage::Pong => debug!("relay heartbeat acknowledged"),
                ServerMessage::Error { message } => warn!(%message, "relay reported an error"),
                ServerMessage::PortRegisterAck(ack) => {
                    debug!(ack = ack.ack, ports = ?ack.ports, "registration update")
                }
            }
        };

        heartbeat.abort();
        drop(tx);
        let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn request(port: PortId, path: &str) -> RequestEnvelope {
        RequestEnvelope {
            request_id: Uuid::new_v4(),
            method: "GET".into(),
            headers: BTreeMap::new(),
            body: String::new(),
            path: path.into(),
            query: BTreeMap::new(),
            port,
            api_key: "k1".into(),
        }
    }

    #[test_timeout::timeout]
    fn target_url_includes_port_path_and_query() {
        let forwarder = Forwarder::new("127.0.0.1").unwrap();
        let mut envelope = request(8080, "/hello/");
        assert_eq!(forwarder.target_url(&envelope), "http://127.0.0.1:8080/hello/");

        envelope.query.insert("q".into(), OneOrMany::One("a b".into()));
        envelope
            .query
            .insert("tag".into(), OneOrMany::Many(vec!["x".into(), "y".into()]));
        assert_eq!(
            forwarder.target_url(&envelope),
            "http://127.0.0.1:8080/hello/?q=a+b&tag=x&tag=y"
        );
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn unreachable_service_answers_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let forwarder = Forwarder::new("127.0.0.1").unwrap();
        let envelope = request(port, "/");
        let request_id = envelope.request_id;
        let response = forwarder.forward(envelope).await;
        assert_eq!(response.request_id, request_id);
        assert_eq!(response.status, 502);
        assert!(!response.decode_body().unwrap().unwrap().is_empty());
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn invalid_method_answers_bad_gateway() {
        let forwarder = Forwarder::new("127.0.0.1").unwrap();
        let mut envelope = request(1, "/");
        envelope.method = "NOT A METHOD".into();
        assert_eq!(forwarder.forward(envelope).await.status, 502);
    }
}
