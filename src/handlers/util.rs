//! Shared request-body helpers for handlers.
//!
//! Bodies are read as raw bytes and parsed here rather than through the `Json`
//! extractor, so that every payload passes the sanitizer before it is given a
//! type and so that parse failures render as the usual JSON error body.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::sanitize::Sanitizer;

/// Parse `body` as JSON, sanitize it, then deserialize the sanitized value.
///
/// Returns the sanitized value alongside the typed view of it.
///
/// # Errors
///
/// `AppError::SerializationError` when the body is not JSON or the sanitized
/// value does not match `T`.
pub fn parse_sanitized<T: DeserializeOwned>(
    sanitizer: &Sanitizer,
    body: &[u8],
) -> AppResult<(Value, T)> {
    let raw: Value = serde_json::from_slice(body)?;
    let clean = sanitizer.sanitize(&raw);
    let typed = T::deserialize(&clean)?;
    Ok((clean, typed))
}

/// Reject blank required string fields.
pub fn require_non_empty(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sanitize::SanitizationPolicy;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Probe {
        name: String,
    }

    #[test]
    fn test_parse_sanitizes_before_typing() {
        let sanitizer = Sanitizer::new(SanitizationPolicy {
            max_string_length: 3,
            max_depth: 5,
        });
        let (clean, probe): (Value, Probe) =
            parse_sanitized(&sanitizer, br#"{"name":"a\u0000bcdef"}"#).unwrap();
        assert_eq!(probe.name, "abc");
        assert_eq!(clean["name"], "abc");
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let result: AppResult<(Value, Probe)> = parse_sanitized(&Sanitizer::default(), b"{nope");
        assert!(matches!(result, Err(AppError::SerializationError(_))));
    }

    #[test]
    fn test_parse_reports_missing_field() {
        let result: AppResult<(Value, Probe)> = parse_sanitized(&Sanitizer::default(), b"{}");
        assert!(matches!(result, Err(AppError::SerializationError(_))));
    }

    #[test]
    fn test_require_non_empty() {
        assert!(require_non_empty("provider", "openai").is_ok());
        assert!(matches!(
            require_non_empty("provider", "  "),
            Err(AppError::BadRequest(_))
        ));
    }
}
