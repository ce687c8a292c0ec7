use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap as HttpHeaderMap, Method};
use beach_pier_core::{
    HeaderMap, OneOrMany, QueryMap, RequestEnvelope, ResponseEnvelope, ServerMessage, TunnelTarget,
};
use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::ControlHandle;
use crate::error::DispatchError;
use crate::pending::PendingTable;

/// The parts of an inbound HTTP call that travel inside a Request Envelope.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub headers: HttpHeaderMap,
    pub query: Option<String>,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct Dispatcher {
    pending: PendingTable,
    request_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(pending: PendingTable, request_timeout: Option<Duration>) -> Self {
        Self {
            pending,
            request_timeout,
        }
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Sends the request over `connection` and suspends until the matching
    /// Response Envelope arrives, the connection dies, or the timeout fires.
    /// No delivery acknowledgment and no retry.
    pub async fn dispatch(
        &self,
        target: &TunnelTarget,
        connection: &ControlHandle,
        request: InboundRequest,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let request_id = Uuid::new_v4();
        let mut pending =
            self.pending
                .insert(request_id, connection.id(), &target.api_key, target.port)?;
        // The connection may have been torn down between resolution and the
        // insert above, after its pending entries were already swept.
        if connection.is_retired() {
            warn!(
                %request_id,
                connection_id = %connection.id(),
                "control connection closed while dispatching"
            );
            counter!("beach_pier_dispatch_failures_total", 1, "reason" => "connection_lost");
            return Err(DispatchError::ConnectionLost);
        }

        let envelope = RequestEnvelope {
            request_id,
            method: request.method.as_str().to_string(),
            headers: headers_to_wire(&request.headers),
            body: RequestEnvelope::encode_body(&request.body),
            path: target.inner_path.clone(),
            query: parse_query(request.query.as_deref()),
            port: target.port,
            api_key: target.api_key.clone(),
        };

        if connection.send(ServerMessage::Request(envelope)).await.is_err() {
            warn!(
                %request_id,
                connection_id = %connection.id(),
                "control connection closed before dispatch"
            );
            return Err(DispatchError::Undeliverable);
        }
        counter!("beach_pier_requests_dispatched_total", 1, "port" => target.port.to_string());
        debug!(
            %request_id,
            api_key = %target.api_key,
            port = target.port,
            path = %target.inner_path,
            "request dispatched"
        );

        let outcome = pending.wait(self.request_timeout).await;
        if let Err(err) = &outcome {
            counter!("beach_pier_dispatch_failures_total", 1, "reason" => err.metric_label());
            warn!(%request_id, error = %err, "tunnelled request failed");
        }
        outcome
    }
}

/// Header names are already lowercase in `http`; repeated headers become lists.
pub fn headers_to_wire(headers: &HttpHeaderMap) -> HeaderMap {
    let mut wire = HeaderMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match wire.get_mut(name.as_str()) {
            Some(existing) => existing.push(value),
            None => {
                wire.insert(name.as_str().to_string(), OneOrMany::One(value));
            }
        }
    }
    wire
}

pub fn parse_query(query: Option<&str>) -> QueryMap {
    let mut map = QueryMap::new();
    let Some(query) = query else {
        return map;
    };
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match map.get_mut(key.as_ref()) {
            Some(existing) => existing.push(value.into_owned()),
            None => {
                map.insert(key.into_owned(), OneOrMany::One(value.into_owned()));
            }
        }
    }
    map
}
