//! Global token-bucket rate limiting

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use crate::dynamic::DynamicConfigHolder;
use crate::error::{codes, gateway_error};
use crate::middleware::TraceId;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Single token bucket shared by every request.
///
/// Rate and burst are read from the holder on each call, so policy
/// changes apply between requests without rebuilding the bucket.
pub struct RateLimiterState {
    holder: Arc<DynamicConfigHolder>,
    bucket: Mutex<Bucket>,
}

impl RateLimiterState {
    pub fn new(holder: Arc<DynamicConfigHolder>) -> Self {
        let burst = holder.load().rate_limit.burst as f64;
        Self {
            holder,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refill by elapsed time, capped at the current burst, then take one
    /// token if available.
    pub fn allow(&self) -> bool {
        let cfg = self.holder.load();
        let rate = cfg.rate_limit.rate;
        let burst = cfg.rate_limit.burst as f64;

        let mut bucket = self.bucket.lock().expect("token bucket poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Reject with `429` code `1003` when the bucket is empty
pub async fn rate_limit(
    State(state): State<Arc<RateLimiterState>>,
    request: Request,
    next: Next,
) -> Response<Body> {
    if !state.holder.load().rate_limit.enabled {
        return next.run(request).await;
    }

    if !state.allow() {
        let trace_id = request
            .extensions()
            .get::<TraceId>()
            .map(|id| id.0.clone())
            .unwrap_or_default();
        return gateway_error(codes::RATE_LIMITED, "rate limit exceeded", &trace_id);
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic::DynamicConfig;
    use std::time::Duration;

    fn limiter(rate: f64, burst: u32) -> RateLimiterState {
        let holder = Arc::new(DynamicConfigHolder::new());
        let mut cfg = DynamicConfig::default();
        cfg.rate_limit.enabled = true;
        cfg.rate_limit.rate = rate;
        cfg.rate_limit.burst = burst;
        holder.store(cfg);
        RateLimiterState::new(holder)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_deny() {
        let state = limiter(1.0, 3);
        assert!(state.allow());
        assert!(state.allow());
        assert!(state.allow());
        assert!(!state.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_at_rate() {
        let state = limiter(2.0, 2);
        assert!(state.allow());
        assert!(state.allow());
        assert!(!state.allow());

        // 2 tokens/sec: after 500ms exactly one token is back
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(state.allow());
        assert!(!state.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_caps_at_burst() {
        let state = limiter(100.0, 2);
        assert!(state.allow());
        assert!(state.allow());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(state.allow());
        assert!(state.allow());
        assert!(!state.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_change_applies_between_requests() {
        let holder = Arc::new(DynamicConfigHolder::new());
        let mut cfg = DynamicConfig::default();
        cfg.rate_limit.enabled = true;
        cfg.rate_limit.rate = 1.0;
        cfg.rate_limit.burst = 1;
        holder.store(cfg.clone());
        let state = RateLimiterState::new(holder.clone());

        assert!(state.allow());
        assert!(!state.allow());

        // policy bumps the rate; the same bucket refills faster now
        cfg.rate_limit.rate = 10.0;
        cfg.rate_limit.burst = 10;
        holder.store(cfg);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(state.allow());
        assert!(state.allow());
    }
}
