use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Local port exposed through a tunnel.
pub type PortId = u16;

/// Header names mapped to one or more values, as carried in envelopes.
pub type HeaderMap = BTreeMap<String, OneOrMany>;

/// Query parameters; repeated keys collapse into [`OneOrMany::Many`].
pub type QueryMap = BTreeMap<String, OneOrMany>;

/// A single string or a list of strings. Scalars (numbers, booleans) sent by
/// loosely typed clients are accepted and stringified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn push(&mut self, value: String) {
        match self {
            OneOrMany::One(existing) => {
                let first = std::mem::take(existing);
                *self = OneOrMany::Many(vec![first, value]);
            }
            OneOrMany::Many(values) => values.push(value),
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        match self {
            OneOrMany::One(value) => std::slice::from_ref(value).iter(),
            OneOrMany::Many(values) => values.iter(),
        }
        .map(String::as_str)
    }
}

impl From<&str> for OneOrMany {
    fn from(value: &str) -> Self {
        OneOrMany::One(value.to_string())
    }
}

impl<'de> Deserialize<'de> for OneOrMany {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Array(items) => items
                .into_iter()
                .map(scalar_to_string)
                .collect::<Option<Vec<_>>>()
                .map(OneOrMany::Many)
                .ok_or_else(|| D::Error::custom("expected a list of scalar values")),
            other => scalar_to_string(other)
                .map(OneOrMany::One)
                .ok_or_else(|| D::Error::custom("expected a string or a list of strings")),
        }
    }
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn port_from_value(value: Value) -> Option<PortId> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|p| PortId::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Ports may arrive as JSON numbers or numeric strings.
fn deserialize_ports<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<PortId>, D::Error> {
    let values = Vec::<Value>::deserialize(deserializer)?;
    values
        .into_iter()
        .map(|value| {
            let shown = value.to_string();
            port_from_value(value).ok_or_else(|| D::Error::custom(format!("invalid port {shown}")))
        })
        .collect()
}

/// Messages sent from the tunnel client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to an account and expose the listed ports.
    RegisterPorts {
        api_key: String,
        #[serde(deserialize_with = "deserialize_ports")]
        ports: Vec<PortId>,
    },
    /// Reply to a previously delivered [`RequestEnvelope`].
    Response(ResponseEnvelope),
    /// Heartbeat to keep the connection alive
    Ping,
}

/// Messages sent from the relay to the tunnel client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    PortRegisterAck(PortRegisterAck),
    Request(RequestEnvelope),
    Pong,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRegisterAck {
    pub ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl PortRegisterAck {
    pub fn accepted(api_key: impl Into<String>, ports: Vec<PortId>) -> Self {
        Self {
            ack: true,
            message: None,
            ports: Some(ports),
            api_key: Some(api_key.into()),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            ack: false,
            message: Some(message.into()),
            ports: None,
            api_key: None,
        }
    }
}

/// One inbound HTTP exchange, pushed to the client that owns the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "requestId")]
    pub request_id: Uuid,
    pub method: String,
    #[serde(default)]
    pub headers: HeaderMap,
    /// Standard base64 of the raw request body.
    #[serde(default)]
    pub body: String,
    /// Path inside the tunnel, always starting with `/`.
    pub path: String,
    #[serde(default)]
    pub query: QueryMap,
    pub port: PortId,
    pub api_key: String,
}

impl RequestEnvelope {
    pub fn encode_body(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    pub fn decode_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.body.as_bytes())
    }

    /// Rebuilds an `application/x-www-form-urlencoded` query string from the
    /// parsed map.
    pub fn query_string(&self) -> Option<String> {
        if self.query.is_empty() {
            return None;
        }
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.query {
            for value in values.values() {
                serializer.append_pair(key, value);
            }
        }
        Some(serializer.finish())
    }
}

/// The client's answer to a [`RequestEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "requestId")]
    pub request_id: Uuid,
    pub status: u16,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ResponseEnvelope {
    pub fn new(request_id: Uuid, status: u16) -> Self {
        Self {
            request_id,
            status,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, bytes: &[u8]) -> Self {
        self.body = Some(STANDARD.encode(bytes));
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    /// `Ok(None)` when the client sent no body at all.
    pub fn decode_body(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        self.body
            .as_deref()
            .map(|body| STANDARD.decode(body.as_bytes()))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn register_ports_accepts_numeric_strings() {
        let raw = json!({
            "type": "register_ports",
            "api_key": "k1",
            "ports": [8080, "3000"]
        });
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ClientMessage::RegisterPorts { api_key, ports } => {
                assert_eq!(api_key, "k1");
                assert_eq!(ports, vec![8080, 3000]);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn register_ports_rejects_out_of_range_port() {
        let raw = json!({ "type": "register_ports", "api_key": "k1", "ports": [70000] });
        assert!(serde_json::from_value::<ClientMessage>(raw).is_err());
    }

    #[test_timeout::timeout]
    fn response_uses_camel_case_request_id() {
        let id = Uuid::new_v4();
        let raw = json!({
            "type": "response",
            "requestId": id.to_string(),
            "status": 200,
            "headers": { "content-type": "text/plain", "set-cookie": ["a=1", "b=2"], "x-count": 3 },
            "body": "b2s="
        });
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        let ClientMessage::Response(envelope) = msg else {
            panic!("expected response");
        };
        assert_eq!(envelope.request_id, id);
        assert_eq!(envelope.decode_body().unwrap().as_deref(), Some(&b"ok"[..]));
        assert_eq!(
            envelope.headers.get("set-cookie"),
            Some(&OneOrMany::Many(vec!["a=1".into(), "b=2".into()]))
        );
        assert_eq!(envelope.headers.get("x-count"), Some(&OneOrMany::One("3".into())));
    }

    #[test_timeout::timeout]
    fn response_without_body_decodes_to_none() {
        let envelope = ResponseEnvelope::new(Uuid::new_v4(), 204);
        assert_eq!(envelope.decode_body().unwrap(), None);
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("body").is_none());
    }

    #[test_timeout::timeout]
    fn rejected_ack_omits_optional_fields() {
        let msg = ServerMessage::PortRegisterAck(PortRegisterAck::rejected("unknown api key"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({ "type": "port_register_ack", "ack": false, "message": "unknown api key" })
        );
    }

    #[test_timeout::timeout]
    fn query_string_round_trips_repeated_keys() {
        let mut query = QueryMap::new();
        query.insert("tag".into(), OneOrMany::One("a b".into()));
        query.get_mut("tag").unwrap().push("c".into());
        let envelope = RequestEnvelope {
            request_id: Uuid::new_v4(),
            method: "GET".into(),
            headers: HeaderMap::new(),
            body: String::new(),
            path: "/".into(),
            query,
            port: 80,
            api_key: "k".into(),
        };
        assert_eq!(envelope.query_string().as_deref(), Some("tag=a+b&tag=c"));
    }
}
