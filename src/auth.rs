//! Authenticator stage (spec §4.2): validates the client credential against
//! the configured key map and rewrites it to the upstream credential.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

use crate::error::GatewayError;
use crate::middleware::context::RequestContext;

const MASK_VISIBLE_PREFIX: usize = 10;
const MASK_STAR_RUN: usize = 8;

/// Immutable map of client credential -> upstream credential, shared across the
/// authenticator, the rate limiters (key derivation) and the metrics endpoint
/// (auth gate), wrapped once at startup.
#[derive(Clone)]
pub struct KeyStore {
    keys: Arc<HashMap<String, String>>,
}

impl KeyStore {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self {
            keys: Arc::new(keys),
        }
    }

    /// Authentication is disabled entirely when the map is empty (spec §4.2).
    pub fn is_disabled(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn lookup(&self, client_credential: &str) -> Option<&str> {
        self.keys.get(client_credential).map(String::as_str)
    }

    pub fn contains(&self, client_credential: &str) -> bool {
        self.keys.contains_key(client_credential)
    }
}

/// Masks a credential for logging/exposition: first `MASK_VISIBLE_PREFIX`
/// characters verbatim, remainder collapsed to a fixed-length star run. A
/// leading `Bearer ` scheme, if present, is preserved outside the masked span.
///
/// Idempotent for all input lengths, including the empty string: a tail
/// already consists of the masked star run is left untouched rather than
/// having a fresh visible span (and another star run) carved out of it. The
/// longest `rest` a single masking pass can produce is `MASK_VISIBLE_PREFIX`
/// real characters followed by `MASK_STAR_RUN` stars, so anything at or under
/// that length ending in the star run is treated as already masked.
pub fn mask(credential: &str) -> String {
    let (scheme, rest) = split_scheme(credential);
    if looks_already_masked(rest) {
        return credential.to_string();
    }
    let visible: String = rest.chars().take(MASK_VISIBLE_PREFIX).collect();
    let masked = format!("{visible}{}", "*".repeat(MASK_STAR_RUN));
    match scheme {
        Some(scheme) => format!("{scheme} {masked}"),
        None => masked,
    }
}

/// True if `rest` is short enough, and ends in enough stars, to itself be the
/// output of a previous [`mask`] call.
fn looks_already_masked(rest: &str) -> bool {
    let max_masked_len = MASK_VISIBLE_PREFIX + MASK_STAR_RUN;
    let char_count = rest.chars().count();
    if char_count == 0 || char_count > max_masked_len {
        return false;
    }
    rest.chars().rev().take(MASK_STAR_RUN).all(|c| c == '*')
}

fn split_scheme(credential: &str) -> (Option<&str>, &str) {
    if let Some(rest) = credential.strip_prefix("Bearer ") {
        (Some("Bearer"), rest)
    } else if let Some(rest) = credential.strip_prefix("bearer ") {
        (Some("Bearer"), rest)
    } else {
        (None, credential)
    }
}

fn strip_bearer(value: &str) -> &str {
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim()
}

/// axum middleware implementing spec §4.2.
///
/// Pass-through when the key store is empty (authentication disabled). Otherwise
/// strips an optional `Bearer ` scheme, looks the remainder up, and on success
/// attaches `client_id`/`upstream_credential` to the request's [`RequestContext`]
/// and rewrites the outgoing `Authorization` header for the upstream.
pub async fn authenticate(
    State(keys): State<KeyStore>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    if keys.is_disabled() {
        RequestContext::ensure(&mut request).lock().client_id = String::new();
        return Ok(next.run(request).await);
    }

    let raw_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(raw_header) = raw_header else {
        tracing::info!("authentication failed: missing Authorization header");
        return Err(GatewayError::Unauthorized);
    };

    let client_credential = strip_bearer(&raw_header).to_string();
    if client_credential.is_empty() {
        tracing::info!("authentication failed: empty credential");
        return Err(GatewayError::Unauthorized);
    }

    let Some(upstream_credential) = keys.lookup(&client_credential).map(str::to_string) else {
        tracing::info!(
            credential = %mask(&client_credential),
            "authentication failed: unknown credential"
        );
        return Err(GatewayError::Unauthorized);
    };

    tracing::debug!(
        credential = %mask(&client_credential),
        "authentication succeeded"
    );

    {
        let ctx = RequestContext::ensure(&mut request);
        let mut ctx = ctx.lock();
        ctx.client_id = client_credential;
        ctx.upstream_credential = upstream_credential.clone();
    }

    let rewritten = format!("Bearer {upstream_credential}");
    if let Ok(value) = axum::http::HeaderValue::from_str(&rewritten) {
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    Ok(next.run(request).await)
}
