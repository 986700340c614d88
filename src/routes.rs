//! Application routing configuration with the guard stack.
//!
//! # Middleware Stack
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │ Security Headers │ ← six hardening headers on every response
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← X-Request-Id, echoed and attached to events
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Trace + Limit   │ ← HTTP spans, request body size cap
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Origin       │ ← 403 for foreign origins  (/api only)
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Rate Limit     │ ← 401 / 429 / 503, one bucket per route
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CSRF        │ ← 403 on mutating methods without a matching token
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - probes, outside every guard
//! - `/api/csrf-token`, `/api/chat` - `general_api` bucket
//! - `/api/keys` - `api_key_operations` bucket
//! - `/api/keys/test` - `api_key_tests` bucket

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::{
    CsrfLayer, OriginLayer, RateLimitLayer, RequestIdLayer, SecurityHeadersLayer,
};
use crate::rate_limit::Bucket;
use crate::state::AppState;

/// Build the application router with all routes and guards configured.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    let public = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check));

    let general = Router::new()
        .route("/api/csrf-token", get(handlers::issue_csrf_token))
        .route("/api/chat", post(handlers::submit_chat))
        .route_layer(CsrfLayer::new(state.tracker.clone()))
        .route_layer(bucket_gate(&state, Bucket::GeneralApi));

    let key_operations = Router::new()
        .route("/api/keys", post(handlers::save_key))
        .route_layer(CsrfLayer::new(state.tracker.clone()))
        .route_layer(bucket_gate(&state, Bucket::ApiKeyOperations));

    let key_tests = Router::new()
        .route("/api/keys/test", post(handlers::test_key))
        .route_layer(CsrfLayer::new(state.tracker.clone()))
        .route_layer(bucket_gate(&state, Bucket::ApiKeyTests));

    let api = Router::new()
        .merge(general)
        .merge(key_operations)
        .merge(key_tests)
        .layer(OriginLayer::new(
            state.origin_policy.clone(),
            (*state.trusted_proxies).clone(),
            state.tracker.clone(),
        ));

    info!(
        app_origin = %state.origin_policy.app_origin(),
        max_body_kb = config.max_request_body_size / 1024,
        auth_throttle = state.auth_throttle.is_some(),
        trusted_proxies = state.trusted_proxies.is_enabled(),
        "Guard stack configured"
    );

    let body_limit = config.max_request_body_size;
    Router::new()
        .merge(public)
        .merge(api)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(RequestIdLayer::new())
        .layer(SecurityHeadersLayer::new())
        .with_state(state)
}

fn bucket_gate(state: &AppState, bucket: Bucket) -> RateLimitLayer {
    RateLimitLayer::new(state.rate_limiter.clone(), state.identity.clone(), bucket)
        .with_failure_throttle(state.auth_throttle.clone())
        .with_trusted_proxies(state.trusted_proxies.clone())
        .with_tracker(state.tracker.clone())
}
