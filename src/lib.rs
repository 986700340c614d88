//! # Chat Shield
//!
//! Request-security middleware for an Axum service that proxies chat traffic
//! to metered, billable AI providers. Every guarded request passes:
//!
//! - **Origin**: only the application's own origin or local development
//! - **Rate Limiting**: fixed windows per identity and bucket
//!   (`general_api`, `api_key_operations`, `api_key_tests`)
//! - **CSRF**: double-submit token, compared in constant time
//! - **Sanitization**: control characters, string length and nesting depth
//! - **Key Screening**: placeholder, repeated and low-entropy provider keys
//!
//! Responses always carry the hardening headers, and usage plus security
//! events are recorded off the request path.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Layers (Headers → Request ID → Origin → Rate Limit → CSRF) │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (chat, keys, csrf-token, health)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Guards (RateLimiter, Sanitizer, KeyDetector)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Tracker → EventStore (JSON lines / memory)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chat_shield::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(state.clone());
//!
//!     // Serve `app` with `into_make_service_with_connect_info::<SocketAddr>()`...
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Identity
//!
//! Trust a header injected by an authenticating proxy:
//! ```bash
//! IDENTITY_HEADER=x-user-id cargo run
//! ```
//!
//! Or ask an auth service:
//! ```bash
//! IDENTITY_SERVICE_URL=http://auth.internal/session cargo run
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod key_detector;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod routes;
pub mod sanitize;
pub mod state;
pub mod tracking;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult, MalformedInput};
pub use identity::{Identity, IdentityResolver};
pub use key_detector::{
    KeyDetector, SuspicionReason, SuspiciousKeyVerdict, detect_suspicious_api_key,
};
pub use rate_limit::{Bucket, BucketPolicy, RateLimiter};
pub use routes::build_router;
pub use sanitize::{SanitizationPolicy, Sanitizer};
pub use state::AppState;
pub use tracking::Tracker;
