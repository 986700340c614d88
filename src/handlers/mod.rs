mod chat;
mod csrf;
mod health;
mod keys;
pub(crate) mod util;

pub use chat::submit_chat;
pub use csrf::issue_csrf_token;
pub use health::{health_check, readiness_check};
pub use keys::{save_key, test_key};
