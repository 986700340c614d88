use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::key_detector::SuspicionReason;
use crate::rate_limit::RateLimitExceeded;
use crate::sanitize::SanitizeError;

/// A request that is structurally invalid for a validator.
///
/// Validators never turn these into a pass/fail decision; they surface them so
/// the caller fails loudly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedInput {
    #[error("header `{0}` is not valid visible ASCII")]
    InvalidHeader(&'static str),

    #[error("Referer header is not a valid URL: {0}")]
    UnparsableReferer(#[source] url::ParseError),
}

/// Application-wide error types with appropriate HTTP status codes.
///
/// Every variant renders as a JSON body carrying a stable `error` string.
/// Security decisions the client can act on (rate limit, authentication) map
/// to 429/401/503; malformed input maps to 400; anything internal maps to 500
/// without leaking details.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Identity service unavailable: {0}")]
    AuthUnavailable(String),

    #[error("No identity resolved for request")]
    Unauthenticated,

    #[error("Rate limit exceeded for bucket {}", .0.bucket)]
    RateLimited(RateLimitExceeded),

    #[error("Client blocked after repeated authentication failures")]
    AuthThrottled { retry_after_secs: u64 },

    #[error("Origin not allowed: {0}")]
    OriginRejected(String),

    #[error("CSRF token missing or mismatched")]
    CsrfRejected,

    #[error("Malformed input: {0}")]
    Malformed(#[from] MalformedInput),

    #[error("Payload rejected by sanitizer: {0}")]
    Sanitize(#[from] SanitizeError),

    #[error("Suspicious API key ({0})")]
    SuspiciousKey(SuspicionReason),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AppError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::AuthUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::RateLimited(_) | AppError::AuthThrottled { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AppError::OriginRejected(_) | AppError::CsrfRejected => StatusCode::FORBIDDEN,
            AppError::Malformed(_)
            | AppError::Sanitize(_)
            | AppError::SuspiciousKey(_)
            | AppError::SerializationError(_)
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable client-facing `error` string.
    pub fn public_message(&self) -> &'static str {
        match self {
            AppError::AuthUnavailable(_) => "Authentication service unavailable",
            AppError::Unauthenticated => "Authentication required",
            AppError::RateLimited(_) | AppError::AuthThrottled { .. } => "Rate limit exceeded",
            AppError::OriginRejected(_) => "Invalid origin",
            AppError::CsrfRejected => "Invalid CSRF token",
            AppError::Malformed(_) | AppError::Sanitize(_) => "Malformed request",
            AppError::SuspiciousKey(_) => "Suspicious API key",
            AppError::SerializationError(_) => "Invalid request body",
            AppError::BadRequest(_) => "Invalid request",
            AppError::Internal(_) => "Internal server error",
            AppError::ConfigError(_) => "Service configuration error",
        }
    }
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let mut body = ErrorResponse {
            error: self.public_message(),
            retry_after: None,
            reason: None,
            message: None,
        };

        match &self {
            AppError::RateLimited(exceeded) => {
                body.retry_after = Some(exceeded.retry_after_secs);
                let mut response = (status, axum::Json(body)).into_response();
                let headers = response.headers_mut();
                headers.insert("retry-after", HeaderValue::from(exceeded.retry_after_secs));
                headers.insert("x-ratelimit-limit", HeaderValue::from(exceeded.limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
                headers.insert("x-ratelimit-reset", HeaderValue::from(exceeded.reset_at_ms));
                return response;
            }
            AppError::AuthThrottled { retry_after_secs } => {
                body.retry_after = Some(*retry_after_secs);
                let mut response = (status, axum::Json(body)).into_response();
                response
                    .headers_mut()
                    .insert("retry-after", HeaderValue::from(*retry_after_secs));
                return response;
            }
            AppError::Unauthenticated => {
                let mut response = (status, axum::Json(body)).into_response();
                response
                    .headers_mut()
                    .insert("www-authenticate", HeaderValue::from_static("Bearer"));
                return response;
            }
            AppError::SuspiciousKey(reason) => body.reason = Some(reason.as_str()),
            AppError::SerializationError(e) => body.message = Some(sanitize_serde_error(e)),
            // Client-facing text written by our own handlers
            AppError::BadRequest(msg) => body.message = Some(msg.clone()),
            _ => {}
        }

        (status, axum::Json(body)).into_response()
    }
}

/// Reduce a serde error to something safe to show a client.
///
/// Serde messages can mention internal type names; only the field name or the
/// broad failure class is kept.
fn sanitize_serde_error(e: &serde_json::Error) -> String {
    use serde_json::error::Category;

    let msg = e.to_string();
    let backticked = || {
        let start = msg.find('`')?;
        let rest = msg.get(start + 1..)?;
        let end = rest.find('`')?;
        rest.get(..end).map(str::to_string)
    };

    if msg.contains("missing field")
        && let Some(field) = backticked()
    {
        return format!("Missing required field: {field}");
    }

    match e.classify() {
        Category::Eof | Category::Syntax => "Malformed JSON in request body".to_string(),
        Category::Data => "Invalid data type in request body".to_string(),
        Category::Io => "Invalid request format".to_string(),
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::rate_limit::Bucket;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limited_response_contract() {
        let err = AppError::RateLimited(RateLimitExceeded {
            bucket: Bucket::GeneralApi,
            limit: 60,
            retry_after_secs: 42,
            reset_at_ms: 1_700_000_060_000,
        });
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers["retry-after"], "42");
        assert_eq!(headers["x-ratelimit-limit"], "60");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["x-ratelimit-reset"], "1700000060000");

        let body = body_json(response).await;
        assert_eq!(
            body,
            serde_json::json!({"error": "Rate limit exceeded", "retryAfter": 42})
        );
    }

    #[tokio::test]
    async fn test_auth_errors_have_exact_bodies() {
        let response = AppError::Unauthenticated.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"error": "Authentication required"})
        );

        let response = AppError::AuthUnavailable("connect refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        // Upstream detail stays server-side
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"error": "Authentication service unavailable"})
        );
    }

    #[tokio::test]
    async fn test_suspicious_key_carries_reason() {
        let response = AppError::SuspiciousKey(SuspicionReason::LowEntropy).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"error": "Suspicious API key", "reason": "low_entropy"})
        );
    }

    #[test]
    fn test_sanitize_serde_error_missing_field() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Probe {
            api_key: String,
        }
        let err = serde_json::from_str::<Probe>("{}").unwrap_err();
        assert_eq!(sanitize_serde_error(&err), "Missing required field: api_key");
    }

    #[test]
    fn test_sanitize_serde_error_syntax() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert_eq!(sanitize_serde_error(&err), "Malformed JSON in request body");
    }

    #[test]
    fn test_malformed_maps_to_bad_request() {
        let err = AppError::from(MalformedInput::InvalidHeader("cookie"));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.public_message(), "Malformed request");
    }
}
