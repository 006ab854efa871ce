//! Per-source rate limiting using governor.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::AppState;

type Bucket = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

struct Entry {
    bucket: Arc<Bucket>,
    expires_at: Instant,
}

/// Token buckets keyed by client address, with idle entries evicted after a
/// TTL. Eviction is lazy: every `allow` call scans the map, which is fine for
/// the small cardinality a single coordinator sees.
pub struct RateLimiter {
    entries: Mutex<HashMap<String, Entry>>,
    quota: Quota,
    ttl: Duration,
}

impl RateLimiter {
    /// `per_second` and `burst` must be non-zero.
    pub fn new(per_second: u32, burst: u32, ttl: Duration) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap())
            .allow_burst(NonZeroU32::new(burst).unwrap());
        Self {
            entries: Mutex::new(HashMap::new()),
            quota,
            ttl,
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        let bucket = {
            let mut entries = self.entries.lock();
            let now = Instant::now();
            entries.retain(|_, entry| entry.expires_at > now);

            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                bucket: Arc::new(GovernorLimiter::direct(self.quota)),
                expires_at: now,
            });
            entry.expires_at = now + self.ttl;
            entry.bucket.clone()
        };

        bucket.check().is_ok()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Middleware denying requests over the per-source budget with 429.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    debug!(key, "rate limit check");
    if !state.limiter.allow(key) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests\n").into_response();
    }

    next.run(req).await
}
