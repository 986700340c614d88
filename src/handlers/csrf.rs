//! CSRF token issuance.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::http::header::{CACHE_CONTROL, SET_COOKIE};
use axum::response::IntoResponse;
use tracing::{debug, instrument};

use crate::error::AppResult;
use crate::middleware::{csrf_cookie, generate_csrf_token};
use crate::models::CsrfTokenResponse;
use crate::state::AppState;

/// Issue a fresh double-submit token.
///
/// The token is returned in the body and set as the `csrf_token` cookie; the
/// page echoes it in `X-CSRF-Token` on every mutating request.
///
/// ```json
/// { "token": "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08" }
/// ```
#[instrument(skip(state))]
pub async fn issue_csrf_token(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let token = generate_csrf_token();
    let cookie = csrf_cookie(&token, state.config.csrf_cookie_secure)?;
    debug!("Issued CSRF token");

    Ok((
        [
            (SET_COOKIE, cookie),
            (CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
        Json(CsrfTokenResponse { token }),
    ))
}
