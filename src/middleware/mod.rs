//! HTTP middleware guarding the API.
//!
//! - **Origin**: only the application's own origin and `http://localhost:<port>`
//! - **Rate Limiting**: fixed-window quotas per identity and bucket, plus a
//!   per-IP throttle on failed identity resolution
//! - **CSRF**: double-submit token check on mutating methods
//! - **Security Headers**: hardening headers on every response
//! - **Request ID**: correlation id for logs and security events
//!
//! # Architecture
//!
//! ```text
//! Request → Security Headers → Request ID → Trace → Body Limit
//!         → Origin → Rate Limit (bucket) → CSRF → Handler
//!              ↓            ↓                ↓
//!             403     401 / 429 / 503       403
//! ```
//!
//! `/health` and `/ready` bypass every guard except the first three layers.

pub mod csrf;
pub mod ip;
pub mod origin;
pub mod rate_limit;
pub mod request_id;
pub mod security_headers;

pub use csrf::{
    CSRF_COOKIE, CSRF_HEADER, CsrfLayer, csrf_cookie, generate_csrf_token, validate_csrf_token,
    validate_csrf_token_with,
};
pub use ip::{TrustedProxies, UNKNOWN_IP, client_ip};
pub use origin::{OriginLayer, OriginPolicy, validate_origin};
pub use rate_limit::{AuthFailureThrottle, RateLimitLayer};
pub use request_id::{REQUEST_ID_HEADER, RequestId, RequestIdLayer};
pub use security_headers::{SecurityHeadersLayer, apply_security_headers, security_headers};
