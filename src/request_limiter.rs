//! Request-rate limiter (spec §4.3): cost-1 instantiation of the generic
//! token bucket, keyed on `client_id` (post-authentication), or the empty
//! string when authentication is disabled and no credential was supplied.

use axum::{extract::{Request, State}, middleware::Next, response::Response};

use crate::error::GatewayError;
use crate::limiter::{Admission, TokenBucketLimiter};
use crate::middleware::context::RequestContext;

pub const IDLE_TTL_SECS: u64 = 3600;
pub const SWEEP_INTERVAL_SECS: u64 = 300;

pub fn build(requests_per_second: u32, burst: u32) -> TokenBucketLimiter {
    TokenBucketLimiter::new(requests_per_second as f64, burst as f64)
}

pub async fn enforce(
    State(limiter): State<TokenBucketLimiter>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let client_id = RequestContext::ensure(&mut request).lock().client_id.clone();

    match limiter.check(&client_id, 1.0) {
        Admission::Admitted => Ok(next.run(request).await),
        Admission::Rejected => {
            tracing::debug!(client = %client_id, "request-rate limit exceeded");
            Err(GatewayError::RequestRateLimited)
        }
    }
}
