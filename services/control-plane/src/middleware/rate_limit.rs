//! Rate limiting middleware
//!
//! Fixed-window counters per authenticated user or per client address.
//! `X-Forwarded-For` is client-controlled, so it only picks the bucket when
//! the deployment says a proxy in front of us sets it.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::{error::ApiError, middleware::AuthContext, observability::metrics, AppState};

/// Rate limit bucket for one caller
#[derive(Debug, Clone)]
struct RateLimitBucket {
    requests: u32,
    window_start: Instant,
}

/// Cleanup interval in seconds
const CLEANUP_INTERVAL_SECS: u64 = 60;

/// In-memory rate limiter (per-process, not distributed)
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<RwLock<HashMap<String, RateLimitBucket>>>,
    window_secs: u64,
    max_requests: u32,
    last_cleanup: Arc<RwLock<Instant>>,
}

impl RateLimiter {
    pub fn new(window_secs: u64, max_requests: u32) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            window_secs,
            max_requests,
            last_cleanup: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Check if request is allowed
    pub async fn check(&self, key: &str) -> bool {
        let mut buckets = self.buckets.write().await;
        let now = Instant::now();
        let window = Duration::from_secs(self.window_secs);

        // Sweep stale buckets at most once a minute, under the same write lock
        let should_cleanup = {
            let last = self.last_cleanup.read().await;
            now.duration_since(*last) >= Duration::from_secs(CLEANUP_INTERVAL_SECS)
        };
        if should_cleanup {
            let before = buckets.len();
            buckets.retain(|_, bucket| now.duration_since(bucket.window_start) < window);
            let evicted = before.saturating_sub(buckets.len());
            if evicted > 0 {
                tracing::debug!("Rate limiter: evicted {} expired buckets", evicted);
            }
            *self.last_cleanup.write().await = now;
        }

        match buckets.get_mut(key) {
            Some(bucket) => {
                // Window elapsed: this request opens a new one
                if now.duration_since(bucket.window_start) >= window {
                    bucket.requests = 1;
                    bucket.window_start = now;
                    true
                } else if bucket.requests < self.max_requests {
                    bucket.requests += 1;
                    true
                } else {
                    false
                }
            }
            // First request from this caller
            None => {
                buckets.insert(
                    key.to_string(),
                    RateLimitBucket {
                        requests: 1,
                        window_start: now,
                    },
                );
                true
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(60, 100)
    }
}

/// Key for unauthenticated callers: the peer address, or the first
/// `X-Forwarded-For` hop when `trust_forwarded_for` is set
fn client_key(request: &Request<Body>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        // The proxy appends to the header; the first hop is the original client
        if let Some(forwarded) = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return format!("ip:{}", forwarded);
        }
    }
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return format!("ip:{}", addr.ip());
    }
    // No peer address outside a real listener; everyone shares one bucket
    "anonymous".to_string()
}

/// Authenticated routes: one bucket per user
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    // Runs after auth, so a verified user gets their own bucket
    let key = match request.extensions().get::<AuthContext>() {
        Some(auth) => format!("user:{}", auth.user_id),
        None => client_key(&request, state.trust_forwarded_for),
    };

    if !state.rate_limiter.check(&key).await {
        state.metrics.increment(metrics::RATE_LIMITED, 1).await;
        return Err(ApiError::RateLimited);
    }

    Ok(next.run(request).await)
}

/// Public routes: one bucket per client address
pub async fn public_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let key = client_key(&request, state.trust_forwarded_for);

    if !state.public_rate_limiter.check(&key).await {
        state.metrics.increment(metrics::RATE_LIMITED, 1).await;
        return Err(ApiError::RateLimited);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_per_key() {
        let limiter = RateLimiter::new(60, 2);
        assert!(limiter.check("user:a").await);
        assert!(limiter.check("user:a").await);
        assert!(!limiter.check("user:a").await);
        assert!(limiter.check("user:b").await);
    }

    #[tokio::test]
    async fn test_window_resets() {
        let limiter = RateLimiter::new(0, 1);
        assert!(limiter.check("k").await);
        // zero-length window: every request starts a new window
        assert!(limiter.check("k").await);
    }

    fn forwarded(peer: Option<&str>) -> Request<Body> {
        let mut request = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        if let Some(peer) = peer {
            let addr: SocketAddr = peer.parse().unwrap();
            request.extensions_mut().insert(ConnectInfo(addr));
        }
        request
    }

    #[test]
    fn test_client_key_ignores_forwarded_header_by_default() {
        assert_eq!(client_key(&forwarded(Some("192.0.2.4:5123")), false), "ip:192.0.2.4");
        assert_eq!(client_key(&forwarded(None), false), "anonymous");
    }

    #[test]
    fn test_client_key_uses_first_hop_behind_trusted_proxy() {
        assert_eq!(client_key(&forwarded(Some("10.0.0.1:443")), true), "ip:203.0.113.9");

        let bare = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_key(&bare, true), "anonymous");
    }
}
