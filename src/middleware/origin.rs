//! Origin / Referer allow-listing.
//!
//! Browsers attach `Origin` to cross-site requests; `Referer` is consulted only
//! when `Origin` is absent. A request is allowed when the presented origin is
//! exactly the application's own origin, or is `http://localhost:<port>`.
//! Requests carrying neither header are allowed: non-browser clients do not
//! send them, and CSRF protects the mutating endpoints regardless.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::{ORIGIN, REFERER};
use axum::http::{HeaderMap, Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::warn;
use url::Url;

use crate::error::{AppError, AppResult, MalformedInput};
use crate::metrics;
use crate::middleware::ip::{TrustedProxies, client_ip};
use crate::middleware::request_id::RequestId;
use crate::models::{Outcome, SecurityEvent, SecurityEventKind};
use crate::tracking::Tracker;

/// The set of origins allowed to call the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPolicy {
    app_origin: String,
}

impl OriginPolicy {
    /// Build from the application's base URL; only scheme, host and port are kept.
    ///
    /// # Errors
    ///
    /// `AppError::ConfigError` when the URL does not parse or has no
    /// scheme/host/port origin.
    pub fn from_base_url(base_url: &str) -> AppResult<Self> {
        let url = Url::parse(base_url)
            .map_err(|e| AppError::ConfigError(format!("APP_BASE_URL: {e}")))?;
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(AppError::ConfigError(format!(
                "APP_BASE_URL ({base_url}) has no http(s) origin"
            )));
        }
        Ok(Self {
            app_origin: origin.ascii_serialization(),
        })
    }

    pub fn app_origin(&self) -> &str {
        &self.app_origin
    }

    /// Whether a serialized origin (`scheme://host[:port]`) may call the API.
    pub fn is_allowed(&self, origin: &str) -> bool {
        origin == self.app_origin || is_local_dev_origin(origin)
    }
}

/// `http://localhost:<port>` with a non-empty, in-range decimal port.
fn is_local_dev_origin(origin: &str) -> bool {
    origin
        .strip_prefix("http://localhost:")
        .is_some_and(|port| port.bytes().all(|b| b.is_ascii_digit()) && port.parse::<u16>().is_ok())
}

/// Check a request's `Origin`, falling back to `Referer`.
///
/// # Errors
///
/// `MalformedInput` when the consulted header is not visible ASCII, or when
/// `Referer` is not a URL.
pub fn validate_origin(
    headers: &HeaderMap,
    policy: &OriginPolicy,
) -> Result<bool, MalformedInput> {
    if let Some(origin) = headers.get(ORIGIN) {
        let origin = origin
            .to_str()
            .map_err(|_| MalformedInput::InvalidHeader("origin"))?;
        return Ok(policy.is_allowed(origin.trim()));
    }

    if let Some(referer) = headers.get(REFERER) {
        let referer = referer
            .to_str()
            .map_err(|_| MalformedInput::InvalidHeader("referer"))?;
        let url = Url::parse(referer.trim()).map_err(MalformedInput::UnparsableReferer)?;
        return Ok(policy.is_allowed(&url.origin().ascii_serialization()));
    }

    Ok(true)
}

/// Rejects requests from foreign origins with 403.
#[derive(Clone)]
pub struct OriginLayer {
    policy: Arc<OriginPolicy>,
    trusted_proxies: Arc<TrustedProxies>,
    tracker: Arc<Tracker>,
}

impl OriginLayer {
    pub fn new(policy: OriginPolicy, trusted_proxies: TrustedProxies, tracker: Tracker) -> Self {
        Self {
            policy: Arc::new(policy),
            trusted_proxies: Arc::new(trusted_proxies),
            tracker: Arc::new(tracker),
        }
    }
}

impl<S> Layer<S> for OriginLayer {
    type Service = OriginService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        OriginService {
            inner,
            policy: self.policy.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

#[derive(Clone)]
pub struct OriginService<S> {
    inner: S,
    policy: Arc<OriginPolicy>,
    trusted_proxies: Arc<TrustedProxies>,
    tracker: Arc<Tracker>,
}

impl<S> Service<Request<Body>> for OriginService<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();

        let presented = req
            .headers()
            .get(ORIGIN)
            .or_else(|| req.headers().get(REFERER))
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let (error, kind) = match validate_origin(req.headers(), &self.policy) {
            Ok(true) => {
                metrics::record_decision("origin", "allowed");
                return Box::pin(async move { inner.call(req).await });
            }
            Ok(false) => (
                AppError::OriginRejected(presented.clone()),
                SecurityEventKind::OriginRejected,
            ),
            Err(e) => (AppError::Malformed(e), SecurityEventKind::MalformedInput),
        };

        let ip = client_ip(&req, &self.trusted_proxies);
        metrics::record_decision("origin", "rejected");
        warn!(
            client_ip = %ip,
            origin = %presented,
            path = %req.uri().path(),
            "Request from disallowed origin"
        );

        let mut event = SecurityEvent::new(kind, Outcome::Blocked)
            .with_client_ip(ip)
            .with_context(serde_json::json!({
                "path": req.uri().path(),
                "origin": presented,
            }));
        if let Some(request_id) = req.extensions().get::<RequestId>() {
            event = event.with_request_id(request_id.as_str());
        }
        self.tracker.log_security_event(event);

        Box::pin(async move { Ok(error.into_response()) })
    }
}
