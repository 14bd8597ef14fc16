//! Generic token-bucket primitive (spec §9 "Polymorphic limiter") shared by
//! the request-rate limiter and the token-budget limiter. Each limiter
//! instantiates this with its own `(rate, burst)` and a cost of either a
//! constant 1 or an estimator's output; the bucket machinery itself doesn't
//! care which.
//!
//! Grounded on the donor's `middleware/rate_limit.rs`: a `DashMap<String, _>`
//! keyed by client, each entry wrapped in its own lock so refill/consume for
//! one client never blocks another (spec §5 "per-entry mutex").

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// A single client's bucket state (spec §3 "Client bucket entry").
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl Bucket {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
            last_used: now,
        }
    }

    /// Refills in place, then tries to deduct `cost` tokens. Returns the
    /// outcome; on rejection the bucket is left untouched beyond the refill
    /// (no partial admission, per spec §4.4).
    fn try_consume(&mut self, cost: f64, rate_per_sec: f64, burst: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate_per_sec).min(burst);
        self.last_refill = now;

        if self.tokens >= cost {
            self.tokens -= cost;
            self.last_used = now;
            true
        } else {
            false
        }
    }
}

/// A token bucket limiter over an arbitrary cost per admission, keyed by an
/// opaque client id string. `rate_per_sec` and `burst` are fixed at
/// construction (spec §4.3/§4.4 derive them differently per limiter, but both
/// feed the same primitive).
#[derive(Clone)]
pub struct TokenBucketLimiter {
    buckets: Arc<DashMap<String, Mutex<Bucket>>>,
    rate_per_sec: f64,
    burst: f64,
}

/// Outcome of an admission check.
pub enum Admission {
    Admitted,
    Rejected,
}

impl TokenBucketLimiter {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            rate_per_sec,
            burst,
        }
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    /// Admit/reject algorithm (spec §4.3 step 1-4, generalized to arbitrary cost).
    ///
    /// A `cost` greater than the bucket's capacity can never be admitted and
    /// the caller should short-circuit before calling this (spec §4.4 step 1)
    /// to avoid creating a bucket entry for a request that was always doomed.
    pub fn check(&self, client_id: &str, cost: f64) -> Admission {
        let now = Instant::now();
        let entry = self
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| Mutex::new(Bucket::new(self.burst, now)));

        let mut bucket = entry.lock();
        if bucket.try_consume(cost, self.rate_per_sec, self.burst, now) {
            Admission::Admitted
        } else {
            Admission::Rejected
        }
    }

    /// Idle eviction sweep (spec §4.3 "Idle eviction"): removes any entry whose
    /// `last_used` age exceeds `ttl`. Holding the map's per-shard write lock
    /// briefly during `retain` is the "tombstone" strategy spec §4.3 allows —
    /// an in-flight `check()` on the same key either completes before the
    /// shard lock is taken or recreates the entry fresh afterwards, never
    /// silently losing an admission decision.
    pub fn evict_idle(&self, ttl: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.lock().last_used) < ttl);
    }

    #[cfg(test)]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Spawns the periodic idle-eviction task for a limiter. The gateway owns the
/// returned handle and the `stop` channel, not the limiter itself (spec §9
/// "Idle eviction... the lifecycle owner is the gateway, not the limiter").
pub fn spawn_eviction_worker(
    limiter: TokenBucketLimiter,
    sweep_interval: Duration,
    idle_ttl: Duration,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    limiter.evict_idle(idle_ttl);
                    tracing::debug!("idle-bucket eviction sweep completed");
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
