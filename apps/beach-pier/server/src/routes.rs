use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use beach_pier_core::{decode_tunnel_path, is_tunnel_path, TunnelTarget, CONTROL_PATH};
use metrics::counter;
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::completion::render_response;
use crate::control;
use crate::dispatch::InboundRequest;
use crate::error::{IngressError, RouteError};
use crate::state::SharedState;

pub const GREETING: &str = "Welcome to Beach Pier";

pub fn build_router(state: SharedState) -> Router {
    let body_limit = state.settings.max_body_bytes;
    Router::new()
        // Only POST is the key check; other methods are ordinary tunnel traffic.
        .route("/verifyApi", post(verify_api).fallback(tunnel_handler))
        .route(CONTROL_PATH, get(control::websocket_handler))
        .route("/_pier/healthz", get(health_handler))
        .route("/_pier/stats", get(stats_handler))
        .route("/_pier/metrics", get(metrics_handler))
        .fallback(tunnel_handler)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<SharedState>) -> Response {
    match state.render_metrics() {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    #[serde(default)]
    api_key: String,
}

/// `200` with the account record, or an empty `400` for unknown keys.
async fn verify_api(State(state): State<SharedState>, body: Bytes) -> Result<Response, IngressError> {
    let request: VerifyRequest = serde_json::from_slice(&body)
        .map_err(|err| IngressError::BadRequest(err.to_string()))?;
    if request.api_key.is_empty() {
        return Ok(StatusCode::BAD_REQUEST.into_response());
    }
    match state.verifier.lookup(&request.api_key).await {
        Ok(Some(record)) => Ok(Json(record).into_response()),
        Ok(None) => Ok(StatusCode::BAD_REQUEST.into_response()),
        Err(err) => {
            warn!(api_key = %request.api_key, error = %err, "credential lookup failed");
            Err(IngressError::VerifierUnavailable)
        }
    }
}

async fn tunnel_handler(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match forward(&state, method, uri, headers, body).await {
        Ok(response) => response,
        Err(err) => {
            let reason = match &err {
                IngressError::Route(route) => route.metric_label(),
                IngressError::Dispatch(dispatch) => dispatch.metric_label(),
                IngressError::Decode(_) => "decode",
                IngressError::BadRequest(_) => "bad_request",
                IngressError::VerifierUnavailable => "verifier_unavailable",
            };
            counter!("beach_pier_ingress_failures_total", 1, "reason" => reason);
            debug!(error = %err, status = %err.status(), "tunnelled request failed");
            err.into_response()
        }
    }
}

async fn forward(
    state: &SharedState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, IngressError> {
    let path = uri.path();
    let target = if is_tunnel_path(path) {
        decode_tunnel_path(path)?
    } else {
        let (api_key, port) = match state.affinity.resolve(&headers) {
            Some(Ok(pair)) => pair,
            _ if method == Method::GET && path == "/" => return Ok(GREETING.into_response()),
            Some(Err(err)) => return Err(err.into()),
            None => return Err(RouteError::MissingAffinity.into()),
        };
        TunnelTarget {
            api_key,
            port,
            inner_path: path.to_string(),
        }
    };

    let connection = state.registry.resolve(&target.api_key, target.port)?;
    let request = InboundRequest {
        method,
        headers,
        query: uri.query().map(str::to_string),
        body,
    };
    let envelope = state.dispatcher.dispatch(&target, &connection, request).await?;
    let mut response = render_response(envelope)?;
    for cookie in state.affinity.issue(&target.api_key, target.port) {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    Ok(response)
}
