//! Double-submit CSRF protection.
//!
//! A mutating request is accepted only when the `X-CSRF-Token` header and the
//! `csrf_token` cookie are both present, non-empty and byte-equal. The
//! comparison runs in constant time for equal-length inputs; a length mismatch
//! is rejected up front, which reveals only the length.
//!
//! Tokens are issued by `GET /api/csrf-token` (see [`generate_csrf_token`] and
//! [`csrf_cookie`]).

use std::fmt::Write as _;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::{COOKIE, HeaderValue};
use axum::http::{HeaderMap, Method, Request, Response};
use axum::response::IntoResponse;
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::warn;

use crate::error::{AppError, MalformedInput};
use crate::identity::Identity;
use crate::metrics;
use crate::middleware::request_id::RequestId;
use crate::models::{Outcome, SecurityEvent, SecurityEventKind};
use crate::tracking::Tracker;

/// Header carrying the client's copy of the token.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Cookie carrying the browser's copy of the token.
pub const CSRF_COOKIE: &str = "csrf_token";

/// Random bytes per issued token (hex encoded, so twice as many characters).
pub const CSRF_TOKEN_BYTES: usize = 32;

/// Generate a fresh token: 32 random bytes, lowercase hex.
pub fn generate_csrf_token() -> String {
    let bytes: [u8; CSRF_TOKEN_BYTES] = rand::random();
    bytes
        .iter()
        .fold(String::with_capacity(CSRF_TOKEN_BYTES * 2), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
}

/// `Set-Cookie` value for an issued token.
///
/// Not `HttpOnly`: the page script has to read the cookie to echo it.
pub fn csrf_cookie(token: &str, secure: bool) -> Result<HeaderValue, MalformedInput> {
    let secure = if secure { "; Secure" } else { "" };
    HeaderValue::from_str(&format!(
        "{CSRF_COOKIE}={token}; Path=/; SameSite=Strict{secure}"
    ))
    .map_err(|_| MalformedInput::InvalidHeader("set-cookie"))
}

/// Find a cookie by name across every `Cookie` header.
///
/// # Errors
///
/// `MalformedInput` if a `Cookie` header is not visible ASCII. Pairs without
/// `=` are nameless cookies and are skipped.
pub fn cookie_value<'a>(
    headers: &'a HeaderMap,
    name: &str,
) -> Result<Option<&'a str>, MalformedInput> {
    let mut found = None;
    for header in headers.get_all(COOKIE) {
        let raw = header
            .to_str()
            .map_err(|_| MalformedInput::InvalidHeader("cookie"))?;
        for pair in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            if found.is_none() && key.trim() == name {
                found = Some(value.trim().trim_matches('"'));
            }
        }
    }
    Ok(found)
}

fn header_token(headers: &HeaderMap) -> Result<Option<&str>, MalformedInput> {
    headers
        .get(CSRF_HEADER)
        .map(|v| {
            v.to_str()
                .map(str::trim)
                .map_err(|_| MalformedInput::InvalidHeader(CSRF_HEADER))
        })
        .transpose()
}

/// Constant-time byte equality.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Check the double-submit pair on a request.
///
/// Returns `Ok(false)` when either side is missing or empty, or when they
/// differ.
///
/// # Errors
///
/// `MalformedInput` when the token or cookie headers cannot be read.
pub fn validate_csrf_token(headers: &HeaderMap) -> Result<bool, MalformedInput> {
    validate_csrf_token_with(headers, constant_time_eq)
}

/// [`validate_csrf_token`] with an explicit comparator for equal-length tokens.
pub fn validate_csrf_token_with<F>(
    headers: &HeaderMap,
    compare: F,
) -> Result<bool, MalformedInput>
where
    F: FnOnce(&[u8], &[u8]) -> bool,
{
    let header = header_token(headers)?.filter(|t| !t.is_empty());
    let cookie = cookie_value(headers, CSRF_COOKIE)?.filter(|t| !t.is_empty());

    let (Some(header), Some(cookie)) = (header, cookie) else {
        return Ok(false);
    };

    if header.len() != cookie.len() {
        return Ok(false);
    }

    Ok(compare(header.as_bytes(), cookie.as_bytes()))
}

/// Methods that change state and therefore need a token.
pub fn requires_csrf(method: &Method) -> bool {
    [Method::POST, Method::PUT, Method::PATCH, Method::DELETE].contains(method)
}

/// Rejects mutating requests without a matching token pair with 403.
#[derive(Clone)]
pub struct CsrfLayer {
    tracker: Arc<Tracker>,
}

impl CsrfLayer {
    pub fn new(tracker: Tracker) -> Self {
        Self {
            tracker: Arc::new(tracker),
        }
    }
}

impl<S> Layer<S> for CsrfLayer {
    type Service = CsrfService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CsrfService {
            inner,
            tracker: self.tracker.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CsrfService<S> {
    inner: S,
    tracker: Arc<Tracker>,
}

impl<S> Service<Request<Body>> for CsrfService<S>
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

        if !requires_csrf(req.method()) {
            return Box::pin(async move { inner.call(req).await });
        }

        let rejection = match validate_csrf_token(req.headers()) {
            Ok(true) => None,
            Ok(false) => Some(AppError::CsrfRejected),
            Err(e) => Some(AppError::Malformed(e)),
        };

        let Some(error) = rejection else {
            metrics::record_decision("csrf", "allowed");
            return Box::pin(async move { inner.call(req).await });
        };

        let (kind, outcome) = match &error {
            AppError::Malformed(_) => (SecurityEventKind::MalformedInput, "malformed"),
            _ => (SecurityEventKind::CsrfRejected, "rejected"),
        };
        metrics::record_decision("csrf", outcome);
        warn!(path = %req.uri().path(), error = %error, "CSRF check failed");

        let mut event = SecurityEvent::new(kind, Outcome::Blocked)
            .with_context(serde_json::json!({ "path": req.uri().path(), "check": "csrf" }));
        if let Some(identity) = req.extensions().get::<Identity>() {
            event = event.with_identity(identity.id.clone());
        }
        if let Some(request_id) = req.extensions().get::<RequestId>() {
            event = event.with_request_id(request_id.as_str());
        }
        self.tracker.log_security_event(event);

        Box::pin(async move { Ok(error.into_response()) })
    }
}
