use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key_detector::SuspiciousKeyVerdict;

/// One turn of a conversation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`
    pub role: String,
    pub content: String,
}

/// Chat request as accepted from the browser (after sanitization).
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Provider the request should be routed to (e.g. `openai`, `anthropic`)
    pub provider: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Provider-specific knobs (temperature, max tokens, ...), passed through
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// Chat request validated and ready for the provider adapter.
#[derive(Debug, Serialize)]
pub struct ChatAccepted {
    pub request_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub message_count: usize,
    /// The sanitized payload exactly as it will be forwarded
    pub payload: serde_json::Value,
}

/// Request to store a provider API key.
#[derive(Debug, Deserialize)]
pub struct SaveKeyRequest {
    pub provider: String,
    pub api_key: String,
    /// Optional human label shown in the key list
    #[serde(default)]
    pub label: Option<String>,
}

/// Response after a key passed screening.
#[derive(Debug, Serialize)]
pub struct SaveKeyResponse {
    pub provider: String,
    /// Key with all but the first and last four characters hidden
    pub masked_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub saved_at: DateTime<Utc>,
}

/// Request to screen a key without storing it.
#[derive(Debug, Deserialize)]
pub struct TestKeyRequest {
    pub provider: String,
    pub api_key: String,
}

/// Screening verdict for a key.
#[derive(Debug, Serialize)]
pub struct TestKeyResponse {
    pub provider: String,
    pub masked_key: String,
    pub verdict: SuspiciousKeyVerdict,
}

/// Freshly issued CSRF token (also set as the `csrf_token` cookie).
#[derive(Debug, Serialize, Deserialize)]
pub struct CsrfTokenResponse {
    pub token: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy`, or `degraded` when no identity source is configured
    pub status: String,
    pub identity_configured: bool,
    pub tracking_enabled: bool,
    /// Rate-limit windows currently held in memory
    pub rate_limit_tracked_keys: usize,
    pub uptime_seconds: u64,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}
