//! Reverse proxy (spec §4.5): the innermost stage of the pipeline. Forwards
//! an admitted request to the single configured upstream and streams the
//! response back without buffering it in full.

use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;

use crate::error::GatewayError;

/// Request headers that must never be forwarded verbatim: they describe the
/// hop to the gateway itself, not the hop from the gateway to the upstream.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Shared state for the proxy stage: a reusable `reqwest::Client` (connection
/// pooling, per spec §4.5 "the proxy itself never retries" — pooling is
/// about reuse, not retry) and the parsed upstream base URL.
#[derive(Clone)]
pub struct ProxyState {
    client: reqwest::Client,
    target: reqwest::Url,
}

impl ProxyState {
    /// Parses `target_url` once at startup; fails start on an invalid URL
    /// (spec §4.5 "Parse target_url once at startup; fail start if invalid").
    pub fn new(target_url: &str, upstream_timeout: Option<Duration>) -> anyhow::Result<Self> {
        let target = reqwest::Url::parse(target_url)
            .map_err(|e| anyhow::anyhow!("invalid target_url '{target_url}': {e}"))?;
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = upstream_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        Ok(Self { client, target })
    }

    fn rewrite_uri(&self, original: &Uri) -> String {
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(original.path());
        format!(
            "{}{}",
            self.target.as_str().trim_end_matches('/'),
            path_and_query
        )
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

fn forward_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut forwarded = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            forwarded.insert(name, value);
        }
    }
    forwarded
}

/// axum handler implementing spec §4.5. Mounted as the fallback route so
/// every path not claimed by `/health` or the metrics endpoint reaches it.
pub async fn forward(State(state): State<ProxyState>, request: Request) -> Response {
    match forward_inner(&state, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn forward_inner(state: &ProxyState, request: Request) -> Result<Response, GatewayError> {
    let method = request.method().clone();
    let dest = state.rewrite_uri(request.uri());
    let headers = forward_headers(request.headers());

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);

    let body_bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| GatewayError::UpstreamTransport(format!("failed to buffer request body: {e}")))?;

    let outbound = state
        .client
        .request(reqwest_method, &dest)
        .headers(headers)
        .body(body_bytes);

    let upstream_response = match outbound.send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() => {
            tracing::warn!(endpoint = %dest, error = %e, "upstream request timed out");
            return Err(GatewayError::UpstreamTimeout);
        }
        Err(e) => {
            tracing::warn!(endpoint = %dest, error = %e, "upstream transport error");
            return Err(GatewayError::UpstreamTransport(e.to_string()));
        }
    };

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);

    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_response.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            if !is_hop_by_hop(&name) {
                response_headers.insert(name, value);
            }
        }
    }

    // Stream the body through rather than buffering it in full (spec §4.5).
    let stream = upstream_response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let body = Body::from_stream(stream);

    let mut response = Response::builder().status(status);
    if let Some(headers_mut) = response.headers_mut() {
        *headers_mut = response_headers;
    }
    Ok(response.body(body).unwrap_or_else(|_| {
        (StatusCode::BAD_GATEWAY, "failed to build upstream response").into_response()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_path_and_query_onto_target() {
        let state = ProxyState::new("https://api.openai.com", None).unwrap();
        let uri: Uri = "/v1/chat/completions?stream=true".parse().unwrap();
        assert_eq!(
            state.rewrite_uri(&uri),
            "https://api.openai.com/v1/chat/completions?stream=true"
        );
    }

    #[test]
    fn trailing_slash_on_target_does_not_double_up() {
        let state = ProxyState::new("https://api.openai.com/", None).unwrap();
        let uri: Uri = "/v1/models".parse().unwrap();
        assert_eq!(state.rewrite_uri(&uri), "https://api.openai.com/v1/models");
    }

    #[test]
    fn invalid_target_url_fails_construction() {
        assert!(ProxyState::new("not-a-url", None).is_err());
    }

    #[test]
    fn hop_by_hop_headers_are_recognized_case_insensitively() {
        let name = HeaderName::from_static("connection");
        assert!(is_hop_by_hop(&name));
    }
}
