use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a tracked operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Request passed every check and was handled
    Allowed,
    /// A guard refused the request
    Blocked,
    /// The guard could not decide (collaborator failure)
    Failed,
}

/// One API-key related operation performed by an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Unique record identifier
    pub id: Uuid,
    /// ISO 8601 timestamp of record creation
    pub timestamp: DateTime<Utc>,
    /// Operation name, e.g. `api_key_saved`, `api_key_tested`, `chat`
    pub operation: String,
    /// Identity that performed it
    pub identity: String,
    pub outcome: Outcome,
    /// Provider the key belongs to, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Correlation id of the originating request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl UsageRecord {
    pub fn new(
        operation: impl Into<String>,
        identity: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation: operation.into(),
            identity: identity.into(),
            outcome,
            provider: None,
            request_id: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Category of a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    RateLimited,
    Unauthenticated,
    AuthThrottled,
    AuthUnavailable,
    OriginRejected,
    CsrfRejected,
    MalformedInput,
    SuspiciousKey,
}

impl SecurityEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityEventKind::RateLimited => "rate_limited",
            SecurityEventKind::Unauthenticated => "unauthenticated",
            SecurityEventKind::AuthThrottled => "auth_throttled",
            SecurityEventKind::AuthUnavailable => "auth_unavailable",
            SecurityEventKind::OriginRejected => "origin_rejected",
            SecurityEventKind::CsrfRejected => "csrf_rejected",
            SecurityEventKind::MalformedInput => "malformed_input",
            SecurityEventKind::SuspiciousKey => "suspicious_key",
        }
    }
}

/// A guard decision worth auditing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: SecurityEventKind,
    pub outcome: Outcome,
    /// Resolved identity, absent when the request never got that far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Free-form details (path, bucket, reason, masked key, ...)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, outcome: Outcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            outcome,
            identity: None,
            client_ip: None,
            request_id: None,
            context: serde_json::Value::Null,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}
