use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use beach_pier_core::{DecodeError, PortId};
use serde::Serialize;
use thiserror::Error;

/// The inbound call cannot be mapped to a live tunnel. Always a 404.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no tunnel registered for this account")]
    UnknownAccount,
    #[error("account exposes no ports")]
    NoPorts,
    #[error("port {0} is not exposed by this account")]
    PortNotRegistered(PortId),
    #[error("tunnel client is not connected")]
    NoLiveConnection,
    #[error("request carries no tunnel address")]
    MissingAffinity,
    #[error("affinity cookies failed verification")]
    InvalidAffinity,
}

impl RouteError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RouteError::UnknownAccount => "unknown_account",
            RouteError::NoPorts => "no_ports",
            RouteError::PortNotRegistered(_) => "port_not_registered",
            RouteError::NoLiveConnection => "no_live_connection",
            RouteError::MissingAffinity => "missing_affinity",
            RouteError::InvalidAffinity => "invalid_affinity",
        }
    }
}

/// Failures after a tunnel was resolved.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request id collision")]
    DuplicateRequestId,
    #[error("tunnel client went away before the request was delivered")]
    Undeliverable,
    #[error("tunnel client disconnected before responding")]
    ConnectionLost,
    #[error("tunnel client did not respond in time")]
    TimedOut,
    #[error("tunnel client sent an invalid response: {0}")]
    InvalidResponse(String),
}

impl DispatchError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DispatchError::DuplicateRequestId => "duplicate_request_id",
            DispatchError::Undeliverable => "undeliverable",
            DispatchError::ConnectionLost => "connection_lost",
            DispatchError::TimedOut => "timed_out",
            DispatchError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Everything that terminates at the HTTP ingress boundary.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("malformed request body: {0}")]
    BadRequest(String),
    #[error("credential store unavailable")]
    VerifierUnavailable,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IngressError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngressError::Decode(_) | IngressError::BadRequest(_) => StatusCode::BAD_REQUEST,
            IngressError::Route(_) => StatusCode::NOT_FOUND,
            IngressError::Dispatch(err) => match err {
                DispatchError::Undeliverable => StatusCode::NOT_FOUND,
                DispatchError::ConnectionLost | DispatchError::InvalidResponse(_) => {
                    StatusCode::BAD_GATEWAY
                }
                DispatchError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
                DispatchError::DuplicateRequestId => StatusCode::INTERNAL_SERVER_ERROR,
            },
            IngressError::VerifierUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            IngressError::Decode(_) | IngressError::BadRequest(_) => "bad_request",
            IngressError::Route(_) => "not_found",
            IngressError::Dispatch(DispatchError::Undeliverable) => "not_found",
            IngressError::Dispatch(DispatchError::TimedOut) => "gateway_timeout",
            IngressError::Dispatch(DispatchError::DuplicateRequestId) => "internal",
            IngressError::Dispatch(_) => "bad_gateway",
            IngressError::VerifierUnavailable => "unavailable",
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorBody {
                error: self.code(),
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}
