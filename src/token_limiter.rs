//! Token-budget limiter (spec §4.4): same bucket machinery as the request
//! limiter, but the cost deducted per request is an estimate of the model
//! tokens the outbound request will consume, not a constant 1.

use axum::{
    body::{to_bytes, Body},
    extract::{FromRef, Request, State},
    middleware::Next,
    response::Response,
};
use serde_json::Value;

use crate::error::GatewayError;
use crate::limiter::{Admission, TokenBucketLimiter};
use crate::middleware::context::RequestContext;

pub const IDLE_TTL_SECS: u64 = 3600;
pub const SWEEP_INTERVAL_SECS: u64 = 300;

/// `rate_tps = model_tokens_per_minute / 60`; `burst = max(model_tokens_per_minute / 6, 100)`
/// (ten seconds' worth, floor 100) per spec §4.4.
pub fn build(model_tokens_per_minute: u64) -> TokenBucketLimiter {
    let rate_tps = model_tokens_per_minute as f64 / 60.0;
    let burst = (model_tokens_per_minute as f64 / 6.0).max(100.0);
    TokenBucketLimiter::new(rate_tps, burst)
}

/// Combined state for the [`enforce`] middleware: the bucket plus the body
/// size cap it needs to buffer the request for estimation. A single struct
/// keeps the middleware on axum's single-`State` `from_fn_with_state` path
/// rather than juggling two independently-threaded state types.
#[derive(Clone)]
pub struct TokenLimiterState {
    pub limiter: TokenBucketLimiter,
    pub max_body_bytes: u64,
}

impl FromRef<TokenLimiterState> for TokenBucketLimiter {
    fn from_ref(state: &TokenLimiterState) -> Self {
        state.limiter.clone()
    }
}

impl FromRef<TokenLimiterState> for u64 {
    fn from_ref(state: &TokenLimiterState) -> Self {
        state.max_body_bytes
    }
}

/// Deterministic, pure token-count estimate over a buffered JSON body (spec §4.4).
///
/// Not a real tokenizer: the spec explicitly asks for an approximation, so this
/// stays stdlib-only text heuristics rather than pulling in a model-specific BPE crate.
pub fn estimate(body: &[u8], _endpoint: &str) -> u64 {
    if body.is_empty() {
        return 0;
    }
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return 0;
    };

    let mut total = 0u64;

    if let Some(model) = value.get("model").and_then(Value::as_str) {
        total += estimate_text(model);
    }

    if let Some(messages) = value.get("messages").and_then(Value::as_array) {
        for message in messages {
            if let Some(content) = message.get("content").and_then(Value::as_str) {
                total += estimate_text(content);
            }
        }
    }

    if let Some(prompt) = value.get("prompt") {
        total += estimate_value(prompt);
    }

    if let Some(input) = value.get("input") {
        total += estimate_value(input);
    }

    total
}

/// Extracts the `model` field for the metrics stage (spec §3 pipeline context
/// "`model` (if parsed)"). Best-effort: malformed or missing bodies yield `None`.
fn parse_model(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<Value>(body)
        .ok()?
        .get("model")?
        .as_str()
        .map(str::to_string)
}

fn estimate_value(value: &Value) -> u64 {
    match value {
        Value::String(s) => estimate_text(s),
        Value::Array(items) => items.iter().map(estimate_value).sum(),
        _ => 0,
    }
}

fn estimate_text(text: &str) -> u64 {
    if text.len() < 100 {
        let words = text.split_whitespace().count() as u64;
        2 * words
    } else {
        (text.chars().count() as u64).div_ceil(4)
    }
}

pub async fn enforce(
    State(limiter): State<TokenBucketLimiter>,
    State(max_body_bytes): State<u64>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let endpoint = RequestContext::ensure(&mut request).lock().endpoint.clone();

    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, max_body_bytes as usize)
        .await
        .map_err(|_| GatewayError::BodyTooLarge)?;

    let cost = estimate(&bytes, &endpoint);
    let model = parse_model(&bytes);
    let mut request = Request::from_parts(parts, Body::from(bytes));

    let client_id = {
        let ctx = RequestContext::ensure(&mut request);
        let mut ctx = ctx.lock();
        ctx.estimated_tokens = cost;
        ctx.model = model;
        ctx.client_id.clone()
    };

    // A cost above the bucket's total capacity can never be admitted (spec §4.4
    // step 1): reject immediately without touching the bucket.
    if cost as f64 > limiter.burst() {
        tracing::debug!(cost, burst = limiter.burst(), "token estimate exceeds burst capacity");
        return Err(GatewayError::TokenRateLimited);
    }

    match limiter.check(&client_id, cost as f64) {
        Admission::Admitted => Ok(next.run(request).await),
        Admission::Rejected => {
            tracing::debug!(client = %client_id, cost, "token-budget limit exceeded");
            Err(GatewayError::TokenRateLimited)
        }
    }
}
