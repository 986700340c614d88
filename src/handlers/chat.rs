//! Chat submission endpoint.
//!
//! Accepts a chat request for one provider, sanitizes it and hands the cleaned
//! payload on. Provider adapters live outside this service; the response
//! echoes exactly what would be forwarded.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use tracing::{info, instrument};

use crate::error::{AppError, AppResult};
use crate::handlers::util::{parse_sanitized, require_non_empty};
use crate::identity::Identity;
use crate::middleware::RequestId;
use crate::models::{ChatAccepted, ChatRequest, Outcome, UsageRecord};
use crate::state::AppState;

/// Accept a chat request.
///
/// # Request Body
///
/// ```json
/// {
///   "provider": "anthropic",
///   "model": "claude-sonnet",
///   "messages": [{"role": "user", "content": "Hello"}],
///   "parameters": {"temperature": 0.7}
/// }
/// ```
///
/// # Errors
///
/// 400 for bodies that are not JSON, do not match the shape above, or carry
/// no messages.
#[instrument(skip_all)]
pub async fn submit_chat(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    request_id: Option<Extension<RequestId>>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<ChatAccepted>)> {
    let (payload, request): (_, ChatRequest) = parse_sanitized(&state.sanitizer, &body)?;
    require_non_empty("provider", &request.provider)?;
    require_non_empty("model", &request.model)?;
    if request.messages.is_empty() {
        return Err(AppError::BadRequest("messages must not be empty".to_string()));
    }

    let request_id = request_id.map(|Extension(id)| id.to_string());
    info!(
        identity = %identity.id,
        provider = %request.provider,
        model = %request.model,
        messages = request.messages.len(),
        "Chat request accepted"
    );

    let mut record =
        UsageRecord::new("chat", identity.id, Outcome::Allowed).with_provider(&request.provider);
    if let Some(id) = &request_id {
        record = record.with_request_id(id);
    }
    state.tracker.track_api_key_usage(record);

    Ok((
        StatusCode::ACCEPTED,
        Json(ChatAccepted {
            request_id,
            provider: request.provider,
            model: request.model,
            message_count: request.messages.len(),
            payload,
        }),
    ))
}
