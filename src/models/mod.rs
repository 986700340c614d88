mod api;
mod record;

pub use api::{
    ChatAccepted, ChatMessage, ChatRequest, CsrfTokenResponse, HealthResponse, SaveKeyRequest,
    SaveKeyResponse, TestKeyRequest, TestKeyResponse,
};
pub use record::{Outcome, SecurityEvent, SecurityEventKind, UsageRecord};
