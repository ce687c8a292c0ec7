use std::{net::SocketAddr, sync::Arc, time::Duration};

use beach_pier_core::{
    ClientMessage, PortId, PortRegisterAck, RequestEnvelope, ResponseEnvelope, ServerMessage,
    CONTROL_PATH,
};
use beach_pier_server::{
    affinity::AffinitySigner,
    serve,
    state::{AppState, RelaySettings, SharedState},
    verifier::StaticVerifier,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type ControlSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct Relay {
    addr: SocketAddr,
    state: SharedState,
    _shutdown: oneshot::Sender<()>,
}

impl Relay {
    async fn start(settings: RelaySettings) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AppState::new(
            Arc::new(StaticVerifier::from_keys(["k1", "k2"])),
            AffinitySigner::random(),
            settings,
        ));
        let (shutdown, signal) = oneshot::channel::<()>();
        tokio::spawn(serve(listener, state.clone(), async move {
            let _ = signal.await;
        }));
        Self {
            addr,
            state,
            _shutdown: shutdown,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn connect(&self) -> ControlSocket {
        let (socket, _) = connect_async(format!("ws://{}{}", self.addr, CONTROL_PATH))
            .await
            .unwrap();
        socket
    }

    async fn register(&self, api_key: &str, ports: Vec<PortId>) -> (ControlSocket, PortRegisterAck) {
        let mut socket = self.connect().await;
        send(
            &mut socket,
            &ClientMessage::RegisterPorts {
                api_key: api_key.into(),
                ports,
            },
        )
        .await;
        let ServerMessage::PortRegisterAck(ack) = recv(&mut socket).await else {
            panic!("expected port_register_ack");
        };
        (socket, ack)
    }
}

async fn send(socket: &mut ControlSocket, message: &ClientMessage) {
    socket
        .send(Message::Text(serde_json::to_string(message).unwrap()))
        .await
        .unwrap();
}

async fn send_binary(socket: &mut ControlSocket, message: &ClientMessage) {
    socket
        .send(Message::Binary(serde_json::to_vec(message).unwrap()))
        .await
        .unwrap();
}

async fn recv(socket: &mut ControlSocket) -> ServerMessage {
    loop {
        match socket.next().await.expect("socket closed").unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Binary(bytes) => return serde_json::from_slice(&bytes).unwrap(),
            _ => continue,
        }
    }
}

async fn recv_request(socket: &mut ControlSocket) -> RequestEnvelope {
    match recv(socket).await {
        ServerMessage::Request(request) => request,
        other => panic!("expected request, got {other:?}"),
    }
}

/// Polls `path` until it answers `expected` or the attempts run out.
async fn eventual_status(relay: &Relay, path: &str, expected: u16) -> u16 {
    let mut status = 0;
    for _ in 0..50 {
        status = http()
            .get(relay.url(path))
            .send()
            .await
            .unwrap()
            .status()
            .as_u16();
        if status == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    status
}

fn http() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[test_timeout::tokio_timeout_test(30)]
async fn registered_client_serves_tunnel_and_affinity_requests() {
    let relay = Relay::start(RelaySettings::default()).await;
    let (mut socket, ack) = relay.register("k1", vec![8080]).await;
    assert!(ack.ack);
    assert_eq!(ack.ports, Some(vec![8080]));

    let client = http();
    let pending = tokio::spawn(
        client
            .post(relay.url("/tunnel/k1_8080/hello?lang=en&tag=a&tag=b"))
            .header("x-custom", "1")
            .body("ping")
            .send(),
    );

    let request = recv_request(&mut socket).await;
    assert_eq!(request.path, "/hello");
    assert_eq!(request.port, 8080);
    assert_eq!(request.method, "POST");
    assert_eq!(request.decode_body().unwrap(), b"ping");
    assert_eq!(request.query["lang"].values().collect::<Vec<_>>(), ["en"]);
    assert_eq!(request.query["tag"].values().collect::<Vec<_>>(), ["a", "b"]);
    assert_eq!(request.headers["x-custom"].values().collect::<Vec<_>>(), ["1"]);

    send(
        &mut socket,
        &ClientMessage::Response(
            ResponseEnvelope::new(request.request_id, 200)
                .with_header("content-type", "text/plain")
                .with_body(b"ok"),
        ),
    )
    .await;

    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    let cookies: Vec<String> = response
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|value| value.to_str().unwrap().split(';').next().unwrap().to_string())
        .collect();
    assert_eq!(cookies.len(), 3);
    assert_eq!(response.text().await.unwrap(), "ok");

    // A relative asset request rides the affinity cookies to the same tunnel.
    let follow_up = tokio::spawn(
        client
            .get(relay.url("/static/app.js"))
            .header("cookie", cookies.join("; "))
            .send(),
    );
    let request = recv_request(&mut socket).await;
    assert_eq!(request.path, "/static/app.js");
    assert_eq!(request.port, 8080);
    assert_eq!(request.api_key, "k1");
    send(
        &mut socket,
        &ClientMessage::Response(ResponseEnvelope::new(request.request_id, 204)),
    )
    .await;
    let response = follow_up.await.unwrap().unwrap();
    assert_eq!(response.status(), 204);
    assert!(relay.state.pending().is_empty());
}

#[test_timeout::tokio_timeout_test(30)]
async fn binary_frames_register_and_answer() {
    let relay = Relay::start(RelaySettings::default()).await;
    let mut socket = relay.connect().await;
    send_binary(
        &mut socket,
        &ClientMessage::RegisterPorts {
            api_key: "k2".into(),
            ports: vec![3000],
        },
    )
    .await;
    let ServerMessage::PortRegisterAck(ack) = recv(&mut socket).await else {
        panic!("expected port_register_ack");
    };
    assert!(ack.ack);

    let pending = tokio::spawn(http().get(relay.url("/tunnel/k2_3000/bin")).send());
    let request = recv_request(&mut socket).await;
    assert_eq!(request.path, "/bin");
    send_binary(
        &mut socket,
        &ClientMessage::Response(ResponseEnvelope::new(request.request_id, 201).with_body(b"binary")),
    )
    .await;

    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(response.text().await.unwrap(), "binary");
}

#[test_timeout::tokio_timeout_test(30)]
async fn unregistered_port_is_rejected_without_dispatch() {
    let relay = Relay::start(RelaySettings::default()).await;
    let (mut socket, _) = relay.register("k1", vec![8080]).await;

    let response = http()
        .get(relay.url("/tunnel/k1_9999/hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Nothing was pushed to the client: the next frame is our pong.
    send(&mut socket, &ClientMessage::Ping).await;
    assert!(matches!(recv(&mut socket).await, ServerMessage::Pong));
}

#[test_timeout::tokio_timeout_test(30)]
async fn unknown_account_is_nacked_and_not_registered() {
    let relay = Relay::start(RelaySettings::default()).await;
    let (mut socket, ack) = relay.register("nobody", vec![8080]).await;
    assert!(!ack.ack);
    assert!(relay.state.registry.is_empty());

    let response = http()
        .get(relay.url("/tunnel/nobody_8080/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Still usable after the negative ack.
    send(
        &mut socket,
        &ClientMessage::RegisterPorts {
            api_key: "k1".into(),
            ports: vec![8080],
        },
    )
    .await;
    let ServerMessage::PortRegisterAck(ack) = recv(&mut socket).await else {
        panic!("expected port_register_ack");
    };
    assert!(ack.ack);
}

#[test_timeout::tokio_timeout_test(30)]
async fn disconnect_unbinds_and_fails_in_flight_requests() {
    let relay = Relay::start(RelaySettings::default()).await;
    let (mut socket, _) = relay.register("k1", vec![8080]).await;

    let in_flight = tokio::spawn(http().get(relay.url("/tunnel/k1_8080/slow")).send());
    let _ = recv_request(&mut socket).await;
    socket.close(None).await.unwrap();

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.status(), 502);

    // Binding invalidation is visible to the next caller.
    assert_eq!(eventual_status(&relay, "/tunnel/k1_8080/again", 404).await, 404);
    assert!(relay.state.connections.is_empty());
}

#[test_timeout::tokio_timeout_test(30)]
async fn malformed_frames_get_an_error_reply() {
    let relay = Relay::start(RelaySettings::default()).await;
    let mut socket = relay.connect().await;
    socket
        .send(Message::Text("{\"type\":\"teleport\"}".into()))
        .await
        .unwrap();
    assert!(matches!(recv(&mut socket).await, ServerMessage::Error { .. }));

    send(&mut socket, &ClientMessage::Ping).await;
    assert!(matches!(recv(&mut socket).await, ServerMessage::Pong));
}

#[test_timeout::tokio_timeout_test(30)]
async fn idle_connections_are_reaped() {
    let relay = Relay::start(RelaySettings {
        idle_timeout: Duration::from_millis(200),
        ..RelaySettings::default()
    })
    .await;
    let (mut socket, _) = relay.register("k1", vec![8080]).await;

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = socket.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => return true,
                _ => continue,
            }
        }
        true
    })
    .await
    .unwrap_or(false);
    assert!(closed);

    assert_eq!(eventual_status(&relay, "/tunnel/k1_8080/", 404).await, 404);
}

#[test_timeout::tokio_timeout_test(30)]
async fn greeting_and_health_endpoints() {
    let relay = Relay::start(RelaySettings::default()).await;
    let greeting = http().get(relay.url("/")).send().await.unwrap();
    assert_eq!(greeting.status(), 200);
    assert_eq!(greeting.text().await.unwrap(), "Welcome to Beach Pier");

    let health: serde_json::Value = http()
        .get(relay.url("/_pier/healthz"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
}
