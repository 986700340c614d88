//! Fuzz testing for the input-facing guards.
//!
//! Arbitrary bytes are fed to the sanitizer (as a raw string and, when they
//! parse, as a JSON payload), the key detector, and the CSRF/origin header
//! checks. None of them may panic, and sanitizer output must respect the
//! configured limits.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_guards -- -max_total_time=60
//! ```

#![no_main]

use axum::http::{HeaderMap, HeaderValue};
use chat_shield::middleware::{OriginPolicy, validate_csrf_token, validate_origin};
use chat_shield::sanitize::{DEFAULT_MAX_STRING_LENGTH, is_stripped};
use chat_shield::{Sanitizer, detect_suspicious_api_key};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let sanitizer = Sanitizer::default();

    if let Ok(s) = std::str::from_utf8(data) {
        let clean = sanitizer.sanitize_string(s);
        assert!(clean.chars().count() <= DEFAULT_MAX_STRING_LENGTH);
        assert!(!clean.chars().any(is_stripped));

        let verdict = detect_suspicious_api_key(s);
        assert_eq!(verdict.is_suspicious, verdict.reason.is_some());
    }

    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) {
        let once = sanitizer.sanitize(&value);
        assert_eq!(sanitizer.sanitize(&once), once);
    }

    if let Ok(value) = HeaderValue::from_bytes(data) {
        let mut headers = HeaderMap::new();
        headers.insert("x-csrf-token", value.clone());
        headers.insert("cookie", value.clone());
        headers.insert("referer", value);
        let _ = validate_csrf_token(&headers);

        if let Ok(policy) = OriginPolicy::from_base_url("https://chat.example.com") {
            let _ = validate_origin(&headers, &policy);
        }
    }
});
