//! End-to-end scenario tests driving the public middleware stages through
//! the same chain order `Gateway::build` assembles, without a real socket or
//! a real upstream.
//!
//! Uses `tower_util::util::ServiceExt::oneshot`, mirroring the donor's own
//! `tower-util` dev-dependency convention (a `tower` 0.5 alias carrying the
//! `util` feature, kept separate from the ordinary `tower = "0.4"` runtime
//! dependency).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tower_util::util::ServiceExt;

use modelgate::auth::{self, KeyStore};
use modelgate::request_limiter;
use modelgate::token_limiter::{self, TokenLimiterState};
use modelgate::validator;

/// Builds the chain in the same order `Gateway::build` uses (spec §2):
/// validator -> authenticator -> request-limiter -> token-limiter -> handler.
/// Metrics and logging are omitted here since they have no bearing on the
/// admission decisions under test.
fn build_router(keys: KeyStore, rps: u32, burst: u32, tpm: u64, hits: Arc<AtomicUsize>) -> Router {
    let request_bucket = request_limiter::build(rps, burst);
    let token_bucket = token_limiter::build(tpm);
    let token_state = TokenLimiterState {
        limiter: token_bucket,
        max_body_bytes: 1_000_000,
    };

    async fn stub_upstream(counter: axum::extract::State<Arc<AtomicUsize>>) -> StatusCode {
        counter.0.fetch_add(1, Ordering::SeqCst);
        StatusCode::OK
    }

    Router::new()
        .route("/v1/chat/completions", post(stub_upstream))
        .route("/v1/embeddings", post(stub_upstream))
        .route("/health", get(stub_upstream))
        .with_state(hits)
        .layer(axum::middleware::from_fn_with_state(
            token_state,
            token_limiter::enforce,
        ))
        .layer(axum::middleware::from_fn_with_state(
            request_bucket,
            request_limiter::enforce,
        ))
        .layer(axum::middleware::from_fn_with_state(
            keys,
            auth::authenticate,
        ))
        .layer(axum::middleware::from_fn_with_state(
            1_000_000u64,
            validator::validate,
        ))
}

fn chat_request(bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json");
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(Body::from(
            serde_json::json!({
                "model": "gpt",
                "messages": [{"role": "user", "content": "hi"}]
            })
            .to_string(),
        ))
        .unwrap()
}

fn no_keys() -> KeyStore {
    KeyStore::new(HashMap::new())
}

#[tokio::test]
async fn rps_one_burst_one_admits_then_rejects_then_recovers() {
    // spec §8 scenario 1: rps=1, burst=1 -> [200, 429], then 200 after >=1s.
    let hits = Arc::new(AtomicUsize::new(0));
    let router = build_router(no_keys(), 1, 1, 6000, hits.clone());

    let first = router
        .clone()
        .oneshot(chat_request(None))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = router
        .clone()
        .oneshot(chat_request(None))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let third = router.oneshot(chat_request(None)).await.unwrap();
    assert_eq!(third.status(), StatusCode::OK);

    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn request_limits_are_independent_per_client() {
    // spec §8 scenario 2: two distinct clients interleaved, rps=1/burst=1,
    // each client's second request rejects independently of the other's.
    let mut map = HashMap::new();
    map.insert("client-a".to_string(), "upstream-a".to_string());
    map.insert("client-b".to_string(), "upstream-b".to_string());
    let hits = Arc::new(AtomicUsize::new(0));
    let router = build_router(KeyStore::new(map), 1, 1, 6000, hits.clone());

    let a1 = router.clone().oneshot(chat_request(Some("client-a"))).await.unwrap();
    let b1 = router.clone().oneshot(chat_request(Some("client-b"))).await.unwrap();
    let a2 = router.clone().oneshot(chat_request(Some("client-a"))).await.unwrap();
    let b2 = router.oneshot(chat_request(Some("client-b"))).await.unwrap();

    assert_eq!(a1.status(), StatusCode::OK);
    assert_eq!(b1.status(), StatusCode::OK);
    assert_eq!(a2.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(b2.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn token_budget_boundary_admits_once_then_rejects() {
    // model_tokens_per_minute=60 -> burst=max(10,100)=100. The chat body here
    // estimates to 2*("gpt"=1 word) + 2*("hi"=1 word) = 4 tokens, well under
    // burst, so repeated admission eventually exhausts the bucket.
    let hits = Arc::new(AtomicUsize::new(0));
    let router = build_router(no_keys(), 1000, 1000, 60, hits.clone());

    let mut last_status = StatusCode::OK;
    for _ in 0..30 {
        let response = router.clone().oneshot(chat_request(None)).await.unwrap();
        last_status = response.status();
        if last_status == StatusCode::TOO_MANY_REQUESTS {
            break;
        }
    }

    assert_eq!(last_status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn unknown_credential_never_reaches_the_upstream_handler() {
    let mut map = HashMap::new();
    map.insert("valid-key".to_string(), "upstream-key".to_string());
    let hits = Arc::new(AtomicUsize::new(0));
    let router = build_router(KeyStore::new(map), 1000, 1000, 6000, hits.clone());

    let response = router
        .oneshot(chat_request(Some("not-a-real-key")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_required_field_is_rejected_before_any_limiter_decrement() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = build_router(no_keys(), 1, 1, 6000, hits.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::json!({ "messages": [] }).to_string()))
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The request-rate bucket was never touched, so a follow-up ordinary
    // request still has its full burst available.
    let follow_up = router.oneshot(chat_request(None)).await.unwrap();
    assert_eq!(follow_up.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_json_body_is_rejected_before_any_limiter_decrement() {
    // spec §6: "invalid JSON" is one of the listed 400 validation failures.
    let hits = Arc::new(AtomicUsize::new(0));
    let router = build_router(no_keys(), 1, 1, 6000, hits.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"#.to_string()))
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The request-rate bucket was never touched, so a follow-up ordinary
    // request still has its full burst available.
    let follow_up = router.oneshot(chat_request(None)).await.unwrap();
    assert_eq!(follow_up.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
