use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use beach_pier_core::ResponseEnvelope;
use metrics::counter;
use tracing::{debug, warn};

use crate::connection::ConnectionId;
use crate::error::DispatchError;
use crate::pending::{Completion, PendingTable};

/// Headers never copied from the client's reply: the relay re-frames and
/// decodes the body, so declaring an encoding or length would corrupt it.
fn is_dropped(name: &HeaderName) -> bool {
    *name == header::CONTENT_ENCODING
        || *name == header::CONTENT_LENGTH
        || *name == header::TRANSFER_ENCODING
        || *name == header::CONNECTION
}

/// Feeds a Response Envelope that arrived on `from` into the pending table.
/// Late, duplicate, or foreign responses are dropped without surfacing
/// anything to either side.
pub fn complete(pending: &PendingTable, from: ConnectionId, response: ResponseEnvelope) -> Completion {
    let request_id = response.request_id;
    let outcome = pending.complete(from, response);
    match outcome {
        Completion::Delivered => {
            counter!("beach_pier_responses_completed_total", 1);
        }
        Completion::Stale => {
            counter!("beach_pier_stale_responses_total", 1);
            debug!(%request_id, connection_id = %from, "dropping stale response");
        }
        Completion::CallerGone => {
            counter!("beach_pier_orphaned_responses_total", 1);
            debug!(%request_id, connection_id = %from, "caller left before response arrived");
        }
    }
    outcome
}

/// Turns the client's reply into the HTTP response for the original caller.
pub fn render_response(envelope: ResponseEnvelope) -> Result<Response, DispatchError> {
    let status = StatusCode::from_u16(envelope.status)
        .map_err(|_| DispatchError::InvalidResponse(format!("status {}", envelope.status)))?;
    let body = envelope
        .decode_body()
        .map_err(|err| DispatchError::InvalidResponse(format!("body: {err}")))?;

    let mut response = Response::new(body.map(Body::from).unwrap_or_else(Body::empty));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, values) in &envelope.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(request_id = %envelope.request_id, header = %name, "skipping invalid header name");
            continue;
        };
        if is_dropped(&name) {
            continue;
        }
        for value in values.values() {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => {
                    warn!(request_id = %envelope.request_id, header = %name, "skipping invalid header value");
                }
            }
        }
    }

    Ok(response)
}
