//! Request validator (spec §4.1): outermost stage of the pipeline. Rejects
//! malformed or oversized requests before any expensive work — authentication,
//! rate limiting, or a round-trip to the upstream — is attempted.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::Response,
};
use serde_json::Value;

use crate::error::GatewayError;

const MAX_HEADER_VALUE_LEN: usize = 8000;

const SUSPICIOUS_SUBSTRINGS: &[&str] = &[
    "drop table",
    "delete from",
    "insert into",
    "update set",
    "<script",
    "javascript:",
    "onerror=",
];

/// Endpoints with required top-level JSON fields (spec §4.1).
fn required_fields(endpoint: &str) -> Option<&'static [&'static str]> {
    match endpoint {
        "/v1/chat/completions" => Some(&["model", "messages"]),
        "/v1/completions" => Some(&["model", "prompt"]),
        "/v1/embeddings" => Some(&["model", "input"]),
        _ => None,
    }
}

fn bypasses_validation(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

fn requires_json_content_type(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

fn scan_headers(headers: &HeaderMap) -> Result<(), GatewayError> {
    for (name, value) in headers {
        let Ok(value_str) = value.to_str() else {
            continue;
        };
        if value_str.len() > MAX_HEADER_VALUE_LEN {
            return Err(GatewayError::Validation(format!(
                "Header {name} exceeds maximum allowed length"
            )));
        }
        let lowered = value_str.to_lowercase();
        if SUSPICIOUS_SUBSTRINGS
            .iter()
            .any(|needle| lowered.contains(needle))
        {
            return Err(GatewayError::Validation(format!(
                "Header {name} contains a disallowed pattern"
            )));
        }
    }
    Ok(())
}

fn check_required_fields(value: &Value, endpoint: &str) -> Result<(), GatewayError> {
    let Some(fields) = required_fields(endpoint) else {
        return Ok(());
    };
    let Some(object) = value.as_object() else {
        return Ok(());
    };
    for field in fields {
        if !object.contains_key(*field) {
            return Err(GatewayError::Validation(format!(
                "Missing required field: {field}"
            )));
        }
    }
    Ok(())
}

/// axum middleware implementing spec §4.1. Runs first in the chain (spec §2).
pub async fn validate(
    State(max_body_bytes): State<u64>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let method = request.method().clone();

    if bypasses_validation(&method) {
        return Ok(next.run(request).await);
    }

    if requires_json_content_type(&method) {
        let content_type = request
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("application/json") {
            return Err(GatewayError::Validation(
                "Content-Type must be application/json".to_string(),
            ));
        }
    }

    if let Some(content_length) = request
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if content_length > max_body_bytes {
            return Err(GatewayError::BodyTooLarge);
        }
    }

    scan_headers(request.headers())?;

    let endpoint = request.uri().path().to_string();
    let (parts, body) = request.into_parts();

    // Enforce the same limit while reading, not just via Content-Length
    // (spec §4.1: "also enforce the limit while reading").
    let bytes = to_bytes(body, max_body_bytes as usize)
        .await
        .map_err(|_| GatewayError::BodyTooLarge)?;

    if !bytes.is_empty() {
        let value = serde_json::from_slice::<Value>(&bytes).map_err(|_| {
            GatewayError::Validation("Invalid JSON body".to_string())
        })?;
        check_required_fields(&value, &endpoint)?;
    }

    // Replace the consumed body so every downstream stage (proxy included)
    // observes exactly what the client sent (spec §4.1 "re-readable").
    let request = Request::from_parts(parts, Body::from(bytes));

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_requests_have_no_required_fields() {
        assert!(required_fields("/health").is_none());
    }

    #[test]
    fn chat_completions_requires_model_and_messages() {
        let missing_model = serde_json::json!({ "messages": [] });
        assert!(check_required_fields(&missing_model, "/v1/chat/completions").is_err());

        let complete = serde_json::json!({ "model": "gpt", "messages": [] });
        assert!(check_required_fields(&complete, "/v1/chat/completions").is_ok());
    }

    #[test]
    fn unrecognized_endpoints_skip_field_checks() {
        let value = serde_json::json!({});
        assert!(check_required_fields(&value, "/v1/unknown").is_ok());
    }

    #[test]
    fn header_value_at_the_length_boundary_is_allowed() {
        let mut headers = HeaderMap::new();
        let value = "a".repeat(MAX_HEADER_VALUE_LEN);
        headers.insert("x-test", value.parse().unwrap());
        assert!(scan_headers(&headers).is_ok());
    }

    #[test]
    fn header_value_over_the_length_boundary_is_rejected() {
        let mut headers = HeaderMap::new();
        let value = "a".repeat(MAX_HEADER_VALUE_LEN + 1);
        headers.insert("x-test", value.parse().unwrap());
        assert!(scan_headers(&headers).is_err());
    }

    #[test]
    fn blocklisted_substrings_are_rejected_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert("x-test", "DROP TABLE users".parse().unwrap());
        assert!(scan_headers(&headers).is_err());
    }

    #[test]
    fn ordinary_header_values_pass() {
        let mut headers = HeaderMap::new();
        headers.insert("x-test", "just a normal value".parse().unwrap());
        assert!(scan_headers(&headers).is_ok());
    }
}
