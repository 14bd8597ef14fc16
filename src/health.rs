//! Health endpoint (spec §2, §4.7, §6): short-circuits the middleware chain
//! entirely and always returns 200, regardless of upstream or limiter state —
//! the gateway has no persistent state whose health could vary.

use axum::{http::StatusCode, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// `GET /health` (spec §6: "returns `{"status":"healthy","version":"<v>"}`
/// with status 200 regardless of other state").
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_reports_healthy() {
        let (status, Json(body)) = health().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "healthy");
    }
}
