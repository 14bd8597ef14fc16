//! Per-client metrics recorder (spec §4.6): counts requests and tokens per
//! client, segmented by endpoint and model, exposed as Prometheus text, JSON,
//! or CSV depending on `Accept`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::auth::{mask, KeyStore};
use crate::middleware::context::RequestContext;

/// Per-endpoint / per-model sub-aggregate (spec §3 "Per-client metrics record").
#[derive(Debug, Default, Clone, Serialize)]
pub struct Aggregate {
    pub requests: u64,
    pub tokens: u64,
}

/// Mutable counters for one client. Guarded by its own mutex so one client's
/// update never blocks another's, mirroring the limiter maps (spec §9).
#[derive(Debug, Default)]
struct ClientMetrics {
    requests_total: u64,
    requests_ok: u64,
    requests_err: u64,
    tokens_total: u64,
    per_endpoint: HashMap<String, Aggregate>,
    per_model: HashMap<String, Aggregate>,
}

/// A structurally-copied, serializable view of one client's counters
/// (spec §4.6 "snapshot() returns a structurally-copied view").
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub client_id: String,
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_err: u64,
    pub tokens_total: u64,
    pub per_endpoint: HashMap<String, Aggregate>,
    pub per_model: HashMap<String, Aggregate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub clients: Vec<ClientSnapshot>,
}

fn is_success(status: StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

/// Concurrent map of client id -> counters (spec §5 "Metrics: per-client
/// record guarded by its own mutex... the top-level map uses the same
/// pattern as the limiter maps").
#[derive(Clone)]
pub struct MetricsRecorder {
    records: Arc<DashMap<String, Mutex<ClientMetrics>>>,
    mask_keys: bool,
}

impl MetricsRecorder {
    pub fn new(mask_keys: bool) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            mask_keys,
        }
    }

    /// Records the outcome of one completed request (spec §4.6 contract).
    pub fn record(
        &self,
        client_id: &str,
        endpoint: &str,
        model: Option<&str>,
        tokens_estimate: u64,
        status: StatusCode,
        _duration: Duration,
    ) {
        let entry = self
            .records
            .entry(client_id.to_string())
            .or_insert_with(|| Mutex::new(ClientMetrics::default()));
        let mut record = entry.lock();

        record.requests_total += 1;
        if is_success(status) {
            record.requests_ok += 1;
        } else {
            record.requests_err += 1;
        }
        record.tokens_total += tokens_estimate;

        let endpoint_agg = record.per_endpoint.entry(endpoint.to_string()).or_default();
        endpoint_agg.requests += 1;
        endpoint_agg.tokens += tokens_estimate;

        if let Some(model) = model {
            let model_agg = record.per_model.entry(model.to_string()).or_default();
            model_agg.requests += 1;
            model_agg.tokens += tokens_estimate;
        }
    }

    /// Point-in-time, causally-consistent-per-client snapshot (spec §5).
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut clients: Vec<ClientSnapshot> = self
            .records
            .iter()
            .map(|entry| {
                let record = entry.value().lock();
                let client_id = if self.mask_keys {
                    mask(entry.key())
                } else {
                    entry.key().clone()
                };
                ClientSnapshot {
                    client_id,
                    requests_total: record.requests_total,
                    requests_ok: record.requests_ok,
                    requests_err: record.requests_err,
                    tokens_total: record.tokens_total,
                    per_endpoint: record.per_endpoint.clone(),
                    per_model: record.per_model.clone(),
                }
            })
            .collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        MetricsSnapshot { clients }
    }

    /// Zeroes every client's counters (spec §4.6 "reset()").
    pub fn reset_all(&self) {
        self.records.clear();
    }

    /// Zeroes one client's counters (spec §4.6 "reset(client_id)").
    pub fn reset_client(&self, client_id: &str) {
        self.records.remove(client_id);
    }
}

/// Metrics-enter/metrics-exit stage (spec §2 step 3 and step 7). Captures the
/// shared [`RequestContext`] handle before calling deeper stages, then reads
/// back whatever they filled in (token estimate, model, final client id)
/// once the response is ready — realizing "wraps the response writer to
/// observe status code" without needing a custom `Response` wrapper type.
pub async fn record_metrics(
    State(recorder): State<MetricsRecorder>,
    mut request: Request,
    next: Next,
) -> Response {
    let ctx = RequestContext::ensure(&mut request);
    let response = next.run(request).await;

    let (client_id, endpoint, model, estimated_tokens, start_time) = {
        let guard = ctx.lock();
        (
            guard.client_id.clone(),
            guard.endpoint.clone(),
            guard.model.clone(),
            guard.estimated_tokens,
            guard.start_time,
        )
    };

    recorder.record(
        &client_id,
        &endpoint,
        model.as_deref(),
        estimated_tokens,
        response.status(),
        start_time.elapsed(),
    );

    response
}

fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();
    out.push_str("# HELP modelgate_requests_total Total requests observed per client.\n");
    out.push_str("# TYPE modelgate_requests_total counter\n");
    for client in &snapshot.clients {
        out.push_str(&format!(
            "modelgate_requests_total{{client=\"{}\"}} {}\n",
            client.client_id, client.requests_total
        ));
    }
    out.push_str("# HELP modelgate_requests_ok_total Successful requests per client.\n");
    out.push_str("# TYPE modelgate_requests_ok_total counter\n");
    for client in &snapshot.clients {
        out.push_str(&format!(
            "modelgate_requests_ok_total{{client=\"{}\"}} {}\n",
            client.client_id, client.requests_ok
        ));
    }
    out.push_str("# HELP modelgate_requests_err_total Failed requests per client.\n");
    out.push_str("# TYPE modelgate_requests_err_total counter\n");
    for client in &snapshot.clients {
        out.push_str(&format!(
            "modelgate_requests_err_total{{client=\"{}\"}} {}\n",
            client.client_id, client.requests_err
        ));
    }
    out.push_str("# HELP modelgate_tokens_total Estimated model tokens consumed per client.\n");
    out.push_str("# TYPE modelgate_tokens_total counter\n");
    for client in &snapshot.clients {
        out.push_str(&format!(
            "modelgate_tokens_total{{client=\"{}\"}} {}\n",
            client.client_id, client.tokens_total
        ));
    }
    out
}

fn render_csv(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::from("client_id,requests_total,requests_ok,requests_err,tokens_total\n");
    for client in &snapshot.clients {
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            client.client_id,
            client.requests_total,
            client.requests_ok,
            client.requests_err,
            client.tokens_total
        ));
    }
    out
}

/// State for the `/metrics` handler: the recorder plus what's needed to gate
/// access with the same key map the authenticator uses (spec §4.6 exposition
/// "`auth_required` gates access to that endpoint using the same key map").
#[derive(Clone)]
pub struct MetricsEndpointState {
    pub recorder: MetricsRecorder,
    pub keys: KeyStore,
    pub auth_required: bool,
    pub expose_prometheus: bool,
    pub expose_json: bool,
    pub expose_csv: bool,
}

fn authorize(headers: &HeaderMap, state: &MetricsEndpointState) -> bool {
    if !state.auth_required {
        return true;
    }
    let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let credential = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .unwrap_or(auth);
    state.keys.contains(credential)
}

/// `GET /metrics` handler (spec §4.6 "Exposition").
pub async fn metrics_handler(
    State(state): State<MetricsEndpointState>,
    headers: HeaderMap,
) -> Response {
    if !authorize(&headers, &state) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let snapshot = state.recorder.snapshot();
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if state.expose_csv && accept.contains("text/csv") {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv")],
            render_csv(&snapshot),
        )
            .into_response();
    }

    if state.expose_json && (accept.contains("application/json") || accept.is_empty()) {
        return (StatusCode::OK, axum::Json(snapshot)).into_response();
    }

    if state.expose_prometheus {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            render_prometheus(&snapshot),
        )
            .into_response();
    }

    (StatusCode::OK, axum::Json(snapshot)).into_response()
}
