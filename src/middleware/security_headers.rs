//! Hardening headers attached to every response.
//!
//! Applied as the outermost layer so that errors produced by other guards
//! (401, 403, 429, 503) carry them too. The six managed names always end up
//! with the mandated value; every other header passes through untouched.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::{
    HeaderName, HeaderValue, REFERRER_POLICY, STRICT_TRANSPORT_SECURITY, X_CONTENT_TYPE_OPTIONS,
    X_FRAME_OPTIONS, X_XSS_PROTECTION,
};
use axum::http::{Request, Response};
use tower::{Layer, Service};

/// The mandated header set, in a stable order.
pub fn security_headers() -> [(HeaderName, HeaderValue); 6] {
    [
        (X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN")),
        (X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")),
        (X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block")),
        (
            REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ),
        (
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static("camera=(), microphone=(), geolocation=(), interest-cohort=()"),
        ),
        (
            STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains; preload"),
        ),
    ]
}

/// Return `response` with every security header set to its mandated value.
///
/// Idempotent: applying it twice yields the same header map.
pub fn apply_security_headers<B>(mut response: Response<B>) -> Response<B> {
    let headers = response.headers_mut();
    for (name, value) in security_headers() {
        headers.insert(name, value);
    }
    response
}

/// Layer running [`apply_security_headers`] on every response.
#[derive(Clone, Copy, Default)]
pub struct SecurityHeadersLayer;

impl SecurityHeadersLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for SecurityHeadersLayer {
    type Service = SecurityHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityHeadersService { inner }
    }
}

#[derive(Clone)]
pub struct SecurityHeadersService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for SecurityHeadersService<S>
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
        Box::pin(async move { inner.call(req).await.map(apply_security_headers) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tower::ServiceExt;

    fn response_with(name: &'static str, value: &'static str) -> Response<()> {
        Response::builder().header(name, value).body(()).unwrap()
    }

    #[test]
    fn test_all_headers_present() {
        let response = apply_security_headers(Response::new(()));
        let headers = response.headers();

        assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-xss-protection"], "1; mode=block");
        assert_eq!(headers["referrer-policy"], "strict-origin-when-cross-origin");
        assert_eq!(
            headers["permissions-policy"],
            "camera=(), microphone=(), geolocation=(), interest-cohort=()"
        );
        assert_eq!(
            headers["strict-transport-security"],
            "max-age=31536000; includeSubDomains; preload"
        );
    }

    #[test]
    fn test_idempotent() {
        let once = apply_security_headers(Response::new(()));
        let twice = apply_security_headers(apply_security_headers(Response::new(())));
        assert_eq!(once.headers(), twice.headers());
        assert_eq!(twice.headers().get_all("x-frame-options").iter().count(), 1);
    }

    #[test]
    fn test_unrelated_headers_preserved() {
        let response = apply_security_headers(response_with("content-type", "application/json"));
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(response.headers().len(), 7);
    }

    #[test]
    fn test_weaker_existing_value_replaced() {
        let response = apply_security_headers(response_with("x-frame-options", "ALLOWALL"));
        let values: Vec<_> = response.headers().get_all("x-frame-options").iter().collect();
        assert_eq!(values, vec!["SAMEORIGIN"]);
        assert_eq!(response.headers().len(), 6);
    }

    #[tokio::test]
    async fn test_layer_covers_error_responses() {
        let app = Router::new()
            .route("/", get(|| async { StatusCode::TOO_MANY_REQUESTS }))
            .layer(SecurityHeadersLayer::new());

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-frame-options"], "SAMEORIGIN");
    }
}
