//! Rate-limit gate for one bucket, keyed by resolved identity.
//!
//! # Flow
//!
//! ```text
//! request ─▶ IP blocked? ─ yes ─▶ 429
//!               │ no
//!               ▼
//!        IdentityResolver ─┬─ Err  ─▶ 503 {"error":"Authentication service unavailable"}
//!                          ├─ None ─▶ failed-auth throttle ─┬─ ok      ─▶ 401
//!                          │                                └─ blocked ─▶ 429
//!                          └─ Some(identity) ─▶ RateLimiter::check
//!                                 ├─ Limited ─▶ 429 + Retry-After, X-RateLimit-*
//!                                 └─ Allowed ─▶ handler (+ X-RateLimit-* on response)
//! ```
//!
//! The resolved [`Identity`](crate::identity::Identity) is inserted into
//! request extensions so handlers can extract it with `Extension<Identity>`.
//!
//! # Failed-auth throttle
//!
//! Requests that resolve to no identity are additionally metered per client IP
//! with Governor's GCRA limiter. Only failures consume quota. Once the quota is
//! exhausted the IP is blocked: every request from it gets 429 without the
//! identity resolver being consulted, until the quota refills.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter as GovernorLimiter};
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use crate::error::AppError;
use crate::identity::IdentityResolver;
use crate::metrics;
use crate::middleware::ip::{TrustedProxies, client_ip};
use crate::middleware::request_id::RequestId;
use crate::models::{Outcome, SecurityEvent, SecurityEventKind};
use crate::rate_limit::{Bucket, RateLimitOutcome, RateLimitStatus, RateLimiter};
use crate::tracking::Tracker;

/// Burst allowance of the failed-auth throttle.
pub const DEFAULT_AUTH_FAILURE_BURST: u32 = 5;

type KeyedLimiter = GovernorLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Per-IP meter of failed identity resolutions.
pub struct AuthFailureThrottle {
    limiter: KeyedLimiter,
    blocked: DashMap<String, Instant>,
}

impl std::fmt::Debug for AuthFailureThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthFailureThrottle")
            .field("tracked_ips", &self.limiter.len())
            .field("blocked_ips", &self.blocked.len())
            .finish()
    }
}

impl AuthFailureThrottle {
    pub fn new(per_minute: NonZeroU32, burst: NonZeroU32) -> Self {
        let quota = Quota::per_minute(per_minute).allow_burst(burst);
        Self {
            limiter: GovernorLimiter::keyed(quota),
            blocked: DashMap::new(),
        }
    }

    /// Throttle allowing `per_minute` failures, burst capped at
    /// [`DEFAULT_AUTH_FAILURE_BURST`]. `None` when `per_minute` is 0.
    pub fn from_limit(per_minute: u32) -> Option<Self> {
        let rate = NonZeroU32::new(per_minute)?;
        let burst = NonZeroU32::new(per_minute.min(DEFAULT_AUTH_FAILURE_BURST))?;
        Some(Self::new(rate, burst))
    }

    /// Count one failure for `ip`. `Err(retry_after_secs)` once over quota,
    /// and `ip` stays blocked for that long.
    pub fn record_failure(&self, ip: &str) -> Result<(), u64> {
        self.limiter.check_key(&ip.to_string()).map_err(|not_until| {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            self.blocked.insert(ip.to_string(), Instant::now() + wait);
            retry_secs(wait)
        })
    }

    /// Seconds until `ip` may try again, without consuming quota.
    pub fn blocked_for(&self, ip: &str) -> Option<u64> {
        let now = Instant::now();
        let until = *self.blocked.get(ip)?;
        if until > now {
            return Some(retry_secs(until - now));
        }
        self.blocked.remove_if(ip, |_, until| *until <= now);
        None
    }

    /// Drop state for IPs whose quota has fully refilled.
    pub fn retain_recent(&self) {
        self.limiter.retain_recent();
        let now = Instant::now();
        self.blocked.retain(|_, until| *until > now);
    }
}

fn retry_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

/// Everything a bucket gate needs, shared by all routes.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    resolver: Arc<dyn IdentityResolver>,
    bucket: Bucket,
    throttle: Option<Arc<AuthFailureThrottle>>,
    trusted_proxies: Arc<TrustedProxies>,
    tracker: Tracker,
}

impl RateLimitLayer {
    pub fn new(
        limiter: Arc<RateLimiter>,
        resolver: Arc<dyn IdentityResolver>,
        bucket: Bucket,
    ) -> Self {
        Self {
            limiter,
            resolver,
            bucket,
            throttle: None,
            trusted_proxies: Arc::new(TrustedProxies::default()),
            tracker: Tracker::disabled(),
        }
    }

    pub fn with_failure_throttle(mut self, throttle: Option<Arc<AuthFailureThrottle>>) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_trusted_proxies(mut self, trusted_proxies: Arc<TrustedProxies>) -> Self {
        self.trusted_proxies = trusted_proxies;
        self
    }

    pub fn with_tracker(mut self, tracker: Tracker) -> Self {
        self.tracker = tracker;
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            gate: self.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    gate: RateLimitLayer,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let gate = self.gate.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let bucket = gate.bucket;
            let request_id = req
                .extensions()
                .get::<RequestId>()
                .map(|id| id.as_str().to_string());
            let path = req.uri().path().to_string();
            let event = |kind: SecurityEventKind, outcome: Outcome| {
                let mut event = SecurityEvent::new(kind, outcome).with_context(
                    serde_json::json!({ "path": path, "bucket": bucket.as_str() }),
                );
                if let Some(id) = &request_id {
                    event = event.with_request_id(id.clone());
                }
                event
            };
            let throttled = |ip: String, retry_after_secs: u64| {
                metrics::record_decision("rate_limit", "auth_throttled");
                warn!(client_ip = %ip, path = %path, "Too many unauthenticated requests");
                gate.tracker.log_security_event(
                    event(SecurityEventKind::AuthThrottled, Outcome::Blocked).with_client_ip(ip),
                );
                AppError::AuthThrottled { retry_after_secs }.into_response()
            };

            let ip = client_ip(&req, &gate.trusted_proxies);
            if let Some(retry_after_secs) =
                gate.throttle.as_ref().and_then(|t| t.blocked_for(&ip))
            {
                return Ok(throttled(ip, retry_after_secs));
            }

            let started = Instant::now();
            let outcome = gate
                .limiter
                .rate_limit(gate.resolver.as_ref(), req.headers(), bucket)
                .await;
            let resolve_result = match &outcome {
                RateLimitOutcome::ServiceUnavailable(_) => "error",
                RateLimitOutcome::Unauthenticated => "anonymous",
                _ => "identified",
            };
            metrics::record_identity_resolve(resolve_result, started.elapsed().as_secs_f64());

            match outcome {
                RateLimitOutcome::Allowed { identity, status } => {
                    metrics::record_decision("rate_limit", "allowed");
                    req.extensions_mut().insert(identity);
                    let mut response = inner.call(req).await?;
                    insert_quota_headers(&mut response, &status);
                    Ok(response)
                }
                RateLimitOutcome::RateLimited { identity, exceeded } => {
                    metrics::record_decision("rate_limit", "limited");
                    warn!(
                        identity = %identity.id,
                        bucket = %bucket,
                        retry_after_secs = exceeded.retry_after_secs,
                        path = %path,
                        "Rate limit exceeded"
                    );
                    gate.tracker.log_security_event(
                        event(SecurityEventKind::RateLimited, Outcome::Blocked)
                            .with_identity(identity.id),
                    );
                    Ok(AppError::RateLimited(exceeded).into_response())
                }
                RateLimitOutcome::Unauthenticated => {
                    if let Some(retry_after_secs) = gate
                        .throttle
                        .as_ref()
                        .and_then(|t| t.record_failure(&ip).err())
                    {
                        return Ok(throttled(ip, retry_after_secs));
                    }

                    metrics::record_decision("rate_limit", "unauthenticated");
                    debug!(client_ip = %ip, path = %path, "No identity for guarded request");
                    gate.tracker.log_security_event(
                        event(SecurityEventKind::Unauthenticated, Outcome::Blocked)
                            .with_client_ip(ip),
                    );
                    Ok(AppError::Unauthenticated.into_response())
                }
                RateLimitOutcome::ServiceUnavailable(e) => {
                    metrics::record_decision("rate_limit", "unavailable");
                    error!(error = %e, path = %path, "Identity resolution failed");
                    gate.tracker.log_security_event(
                        event(SecurityEventKind::AuthUnavailable, Outcome::Failed)
                            .with_client_ip(ip),
                    );
                    Ok(AppError::AuthUnavailable(e.to_string()).into_response())
                }
            }
        })
    }
}

/// Informational quota headers on an allowed response.
fn insert_quota_headers(response: &mut Response<Body>, status: &RateLimitStatus) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(status.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(status.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(status.reset_at_ms));
}
