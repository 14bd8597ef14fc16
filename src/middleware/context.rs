//! Pipeline context (spec §3 "Pipeline context"): attached to a request as it
//! flows through the middleware chain, never persisted beyond the request.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use parking_lot::Mutex;

/// Per-request scratch state threaded through the middleware chain via
/// [`axum::http::Extensions`]. Each stage fills in the fields it owns.
///
/// Stored behind an `Arc<Mutex<_>>` rather than cloned in and out of
/// extensions: the metrics stage (spec §4.6) needs to read fields — the
/// token estimate, the parsed model — that deeper stages fill in *after*
/// the metrics middleware has already called `next.run`. Sharing one handle
/// means a write made deep in the chain is visible once `next.run` returns,
/// without threading the context back out through the response.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Client credential as received, post-authentication. Empty string when
    /// authentication is disabled and no credential was supplied (spec §4.3).
    pub client_id: String,
    /// The credential rewritten for the upstream; never logged unmasked.
    pub upstream_credential: String,
    /// When the request entered the pipeline (for duration metrics).
    pub start_time: Instant,
    /// Token estimate computed by the token-budget limiter, if it ran.
    pub estimated_tokens: u64,
    /// Model name parsed from the request body, if recognized.
    pub model: Option<String>,
    /// Normalized URL path used to key metrics and endpoint-specific validation.
    pub endpoint: String,
}

pub type SharedContext = Arc<Mutex<RequestContext>>;

impl RequestContext {
    pub fn new(endpoint: String) -> Self {
        Self {
            client_id: String::new(),
            upstream_credential: String::new(),
            start_time: Instant::now(),
            estimated_tokens: 0,
            model: None,
            endpoint,
        }
    }

    /// Fetches the shared context already attached to `request`, inserting a
    /// fresh one (keyed on the request's current path) if this is the first
    /// stage to touch it. The returned handle is cheap to clone and share.
    pub fn ensure(request: &mut Request) -> SharedContext {
        if request.extensions().get::<SharedContext>().is_none() {
            let endpoint = request.uri().path().to_string();
            let ctx: SharedContext = Arc::new(Mutex::new(RequestContext::new(endpoint)));
            request.extensions_mut().insert(ctx);
        }
        request
            .extensions()
            .get::<SharedContext>()
            .expect("just inserted")
            .clone()
    }
}
