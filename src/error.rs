//! Shared error taxonomy for the gateway request pipeline.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Errors that can terminate the request pipeline before it reaches the upstream.
///
/// Each variant maps to exactly one client-visible status code and carries only
/// a short, plain-text reason — never internals, stack traces, or credentials.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("request body exceeds the configured size limit")]
    BodyTooLarge,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Too many requests for this client")]
    RequestRateLimited,

    #[error("Too many requests for this client")]
    TokenRateLimited,

    #[error("{0}")]
    UpstreamTransport(String),

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("{0}")]
    Configuration(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            GatewayError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            GatewayError::BodyTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            GatewayError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            GatewayError::RequestRateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            GatewayError::TokenRateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            GatewayError::UpstreamTransport(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            GatewayError::UpstreamTimeout => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            GatewayError::Configuration(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        (status, message).into_response()
    }
}
