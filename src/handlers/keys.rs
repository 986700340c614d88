//! Provider API key endpoints.
//!
//! - `POST /api/keys` stores a key; placeholder or synthetic keys are refused
//!   with 400 before anything is stored
//! - `POST /api/keys/test` screens a key and reports the verdict without
//!   storing it
//!
//! Both record a usage entry; a flagged key also produces a security event.
//! Keys are never logged, only their masked form.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::error::{AppError, AppResult};
use crate::handlers::util::{parse_sanitized, require_non_empty};
use crate::identity::Identity;
use crate::key_detector::{SuspiciousKeyVerdict, mask_key};
use crate::metrics;
use crate::middleware::RequestId;
use crate::models::{
    Outcome, SaveKeyRequest, SaveKeyResponse, SecurityEvent, SecurityEventKind, TestKeyRequest,
    TestKeyResponse, UsageRecord,
};
use crate::state::AppState;

/// Store a provider key after screening it.
///
/// # Errors
///
/// 400 `{"error":"Suspicious API key","reason":"..."}` for flagged keys.
#[instrument(skip_all)]
pub async fn save_key(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    request_id: Option<Extension<RequestId>>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<SaveKeyResponse>)> {
    let (_, request): (_, SaveKeyRequest) = parse_sanitized(&state.sanitizer, &body)?;
    require_non_empty("provider", &request.provider)?;
    require_non_empty("api_key", &request.api_key)?;

    let request_id = request_id.map(|Extension(id)| id.to_string());
    let masked_key = mask_key(&request.api_key);
    let verdict = state.key_detector.detect(&request.api_key);

    if let Some(reason) = verdict.reason {
        report_suspicious_key(
            &state,
            &identity,
            request_id.as_deref(),
            &request.provider,
            &masked_key,
            verdict,
            Outcome::Blocked,
        );
        track(
            &state,
            "api_key_saved",
            &identity,
            &request.provider,
            request_id.as_deref(),
            Outcome::Blocked,
        );
        return Err(AppError::SuspiciousKey(reason));
    }

    info!(
        identity = %identity.id,
        provider = %request.provider,
        key = %masked_key,
        "API key saved"
    );
    track(
        &state,
        "api_key_saved",
        &identity,
        &request.provider,
        request_id.as_deref(),
        Outcome::Allowed,
    );

    Ok((
        StatusCode::CREATED,
        Json(SaveKeyResponse {
            provider: request.provider,
            masked_key,
            label: request.label,
            saved_at: Utc::now(),
        }),
    ))
}

/// Screen a provider key without storing it.
#[instrument(skip_all)]
pub async fn test_key(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    request_id: Option<Extension<RequestId>>,
    body: Bytes,
) -> AppResult<Json<TestKeyResponse>> {
    let (_, request): (_, TestKeyRequest) = parse_sanitized(&state.sanitizer, &body)?;
    require_non_empty("provider", &request.provider)?;
    require_non_empty("api_key", &request.api_key)?;

    let request_id = request_id.map(|Extension(id)| id.to_string());
    let masked_key = mask_key(&request.api_key);
    let verdict = state.key_detector.detect(&request.api_key);

    if verdict.is_suspicious {
        report_suspicious_key(
            &state,
            &identity,
            request_id.as_deref(),
            &request.provider,
            &masked_key,
            verdict,
            Outcome::Allowed,
        );
    }
    track(
        &state,
        "api_key_tested",
        &identity,
        &request.provider,
        request_id.as_deref(),
        Outcome::Allowed,
    );

    Ok(Json(TestKeyResponse {
        provider: request.provider,
        masked_key,
        verdict,
    }))
}

fn report_suspicious_key(
    state: &AppState,
    identity: &Identity,
    request_id: Option<&str>,
    provider: &str,
    masked_key: &str,
    verdict: SuspiciousKeyVerdict,
    outcome: Outcome,
) {
    let reason = verdict.reason.map(|r| r.as_str()).unwrap_or("unknown");
    metrics::record_suspicious_key(reason);
    warn!(
        identity = %identity.id,
        provider = %provider,
        key = %masked_key,
        reason,
        "Suspicious API key submitted"
    );

    let mut event = SecurityEvent::new(SecurityEventKind::SuspiciousKey, outcome)
        .with_identity(identity.id.clone())
        .with_context(json!({
            "provider": provider,
            "masked_key": masked_key,
            "reason": reason,
        }));
    if let Some(id) = request_id {
        event = event.with_request_id(id);
    }
    state.tracker.log_security_event(event);
}

fn track(
    state: &AppState,
    operation: &str,
    identity: &Identity,
    provider: &str,
    request_id: Option<&str>,
    outcome: Outcome,
) {
    let mut record =
        UsageRecord::new(operation, identity.id.clone(), outcome).with_provider(provider);
    if let Some(id) = request_id {
        record = record.with_request_id(id);
    }
    state.tracker.track_api_key_usage(record);
}
