//! End-to-end tests for the guarded API over real HTTP.
//!
//! Each test starts the full router on an ephemeral port with a header-based
//! identity source and a JSON Lines event log in a temp directory, then talks
//! to it with `reqwest`.
//!
//! Run with: `cargo test --test integration_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chat_shield::rate_limit::{BucketPolicies, BucketPolicy};
use chat_shield::{AppState, Bucket, Config, build_router};
use reqwest::header::{COOKIE, ORIGIN, SET_COOKIE};
use reqwest::{Client, Response, StatusCode};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const APP_ORIGIN: &str = "https://chat.example.com";

/// Test fixture that owns the server task and its event log.
struct TestFixture {
    base_url: String,
    client: Client,
    state: AppState,
    stop: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
    log_path: PathBuf,
    _dir: TempDir,
}

impl TestFixture {
    async fn new() -> Self {
        Self::with_policies(
            BucketPolicies::default()
                .with(Bucket::ApiKeyOperations, BucketPolicy::new(3, 60_000))
                .with(Bucket::ApiKeyTests, BucketPolicy::new(2, 60_000)),
        )
        .await
    }

    async fn with_policies(policies: BucketPolicies) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let log_path = dir.path().join("events.jsonl");

        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            app_base_url: APP_ORIGIN.to_string(),
            csrf_cookie_secure: false,
            identity_header: Some("x-user-id".to_string()),
            rate_limit_policies: policies,
            auth_failure_limit: 2,
            event_log_path: Some(log_path.clone()),
            metrics_port: 0,
            ..Config::default()
        };

        let state = AppState::new(config).expect("Failed to build state");
        let app = build_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to ephemeral port");
        let addr = listener.local_addr().expect("Failed to get local address");

        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = stopped.await;
            })
            .await
            .expect("Server failed");
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: format!("http://{addr}"),
            client,
            state,
            stop: Some(stop),
            server: Some(server),
            log_path,
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fetch a CSRF token the way the browser page does.
    async fn csrf_token(&self, user: &str) -> String {
        let response = self
            .client
            .get(self.url("/api/csrf-token"))
            .header("x-user-id", user)
            .header(ORIGIN, APP_ORIGIN)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    async fn post(&self, path: &str, user: &str, token: &str, body: Value) -> Response {
        self.client
            .post(self.url(path))
            .header("x-user-id", user)
            .header(ORIGIN, APP_ORIGIN)
            .header("x-csrf-token", token)
            .header(COOKIE, format!("csrf_token={token}"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    /// Stop the server, flush pending writes and return the event log lines.
    async fn finish(mut self) -> Vec<Value> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(server) = self.server.take() {
            server.await.unwrap();
        }
        self.state.shutdown().await;

        let contents = tokio::fs::read_to_string(&self.log_path)
            .await
            .unwrap_or_default();
        contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

fn chat_body() -> Value {
    json!({
        "provider": "openai",
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "Hello\u{0007}!"}],
        "parameters": {"temperature": 0.2}
    })
}

fn real_key() -> &'static str {
    "sk-proj-Q7vZ2mK9pL4xW8nR3tY6bH1cJ5dF0gSa"
}

// =============================================================================
// Probes
// =============================================================================

#[tokio::test]
async fn test_health_reports_configuration() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["strict-transport-security"],
        "max-age=31536000; includeSubDomains; preload"
    );

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["identity_configured"], true);
    assert_eq!(body["tracking_enabled"], true);

    let ready = fixture
        .client
        .get(fixture.url("/ready"))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    fixture.finish().await;
}

// =============================================================================
// Full request flow
// =============================================================================

#[tokio::test]
async fn test_chat_flow_records_usage() {
    let fixture = TestFixture::new().await;
    let token = fixture.csrf_token("alice").await;

    let response = fixture.post("/api/chat", "alice", &token, chat_body()).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.headers()["x-ratelimit-limit"], "60");
    // The token fetch counted against general_api as well
    assert_eq!(response.headers()["x-ratelimit-remaining"], "58");

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payload"]["messages"][0]["content"], "Hello!");
    assert_eq!(body["payload"]["parameters"]["temperature"], 0.2);

    let lines = fixture.finish().await;
    let usage: Vec<_> = lines.iter().filter(|l| l["type"] == "usage").collect();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0]["operation"], "chat");
    assert_eq!(usage[0]["identity"], "alice");
    assert_eq!(usage[0]["provider"], "openai");
}

#[tokio::test]
async fn test_csrf_cookie_attributes() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .get(fixture.url("/api/csrf-token"))
        .header("x-user-id", "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["cache-control"], "no-store");

    let cookie = response.headers()[SET_COOKIE].to_str().unwrap().to_string();
    assert!(cookie.contains("Path=/"));
    assert!(cookie.contains("SameSite=Strict"));
    assert!(!cookie.contains("Secure"));

    fixture.finish().await;
}

// =============================================================================
// Guard rejections
// =============================================================================

#[tokio::test]
async fn test_foreign_origin_logged_as_security_event() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .post(fixture.url("/api/chat"))
        .header("x-user-id", "mallory")
        .header(ORIGIN, "https://attacker.example")
        .json(&chat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()["x-frame-options"], "SAMEORIGIN");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Invalid origin");

    let lines = fixture.finish().await;
    let events: Vec<_> = lines
        .iter()
        .filter(|l| l["type"] == "security_event")
        .collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["kind"], "origin_rejected");
}

#[tokio::test]
async fn test_localhost_origin_allowed() {
    let fixture = TestFixture::new().await;
    let token = fixture.csrf_token("dev").await;

    let response = fixture
        .client
        .post(fixture.url("/api/chat"))
        .header("x-user-id", "dev")
        .header(ORIGIN, "http://localhost:5173")
        .header("x-csrf-token", &token)
        .header(COOKIE, format!("csrf_token={token}"))
        .json(&chat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    fixture.finish().await;
}

#[tokio::test]
async fn test_mismatched_csrf_token_rejected() {
    let fixture = TestFixture::new().await;
    let token = fixture.csrf_token("alice").await;
    let other = fixture.csrf_token("alice").await;
    assert_ne!(token, other);

    let response = fixture
        .client
        .post(fixture.url("/api/chat"))
        .header("x-user-id", "alice")
        .header("x-csrf-token", &token)
        .header(COOKIE, format!("csrf_token={other}"))
        .json(&chat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Invalid CSRF token");

    fixture.finish().await;
}

#[tokio::test]
async fn test_repeated_auth_failures_throttled() {
    let fixture = TestFixture::new().await;
    let token = fixture.csrf_token("alice").await;

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let response = fixture
            .client
            .post(fixture.url("/api/chat"))
            .json(&chat_body())
            .send()
            .await
            .unwrap();
        statuses.push(response.status());
    }
    assert_eq!(
        statuses,
        vec![
            StatusCode::UNAUTHORIZED,
            StatusCode::UNAUTHORIZED,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );

    // The address stays blocked until its quota refills, credentials or not
    let response = fixture.post("/api/chat", "alice", &token, chat_body()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));

    let lines = fixture.finish().await;
    let kinds: Vec<_> = lines
        .iter()
        .filter(|l| l["type"] == "security_event")
        .map(|l| l["kind"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(kinds.iter().filter(|k| *k == "unauthenticated").count(), 2);
    assert_eq!(kinds.iter().filter(|k| *k == "auth_throttled").count(), 2);
}

// =============================================================================
// Key endpoints and buckets
// =============================================================================

#[tokio::test]
async fn test_save_key_masks_and_screens() {
    let fixture = TestFixture::new().await;
    let token = fixture.csrf_token("alice").await;

    let response = fixture
        .post(
            "/api/keys",
            "alice",
            &token,
            json!({"provider": "openai", "api_key": real_key(), "label": "work"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    let masked = body["masked_key"].as_str().unwrap();
    assert_eq!(masked, "sk-p…0gSa");
    assert_eq!(body["label"], "work");

    let response = fixture
        .post(
            "/api/keys",
            "alice",
            &token,
            json!({"provider": "openai", "api_key": "sk-test-1234567890"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Suspicious API key");
    assert_eq!(body["reason"], "placeholder");

    let lines = fixture.finish().await;
    let raw = serde_json::to_string(&lines).unwrap();
    assert!(!raw.contains(real_key()));
    assert!(!raw.contains("sk-test-1234567890"));
    assert!(lines.iter().any(|l| l["kind"] == "suspicious_key"));
}

#[tokio::test]
async fn test_key_buckets_are_independent() {
    let fixture = TestFixture::new().await;
    let token = fixture.csrf_token("alice").await;
    let body = json!({"provider": "anthropic", "api_key": real_key()});

    for expected_remaining in ["1", "0"] {
        let response = fixture
            .post("/api/keys/test", "alice", &token, body.clone())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], expected_remaining);
        let verdict: Value = response.json().await.unwrap();
        assert_eq!(verdict["verdict"]["isSuspicious"], false);
    }

    let response = fixture
        .post("/api/keys/test", "alice", &token, body.clone())
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    let rejected: Value = response.json().await.unwrap();
    assert_eq!(rejected["error"], "Rate limit exceeded");
    assert!(rejected["retryAfter"].as_u64().unwrap() >= 1);

    // Another identity and another bucket are untouched
    let response = fixture.post("/api/keys/test", "bob", &token, body.clone()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = fixture.post("/api/keys", "alice", &token, body).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    fixture.finish().await;
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let fixture = TestFixture::new().await;
    let token = fixture.csrf_token("alice").await;

    let response = fixture
        .client
        .post(fixture.url("/api/chat"))
        .header("x-user-id", "alice")
        .header("x-csrf-token", &token)
        .header(COOKIE, format!("csrf_token={token}"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    fixture.finish().await;
}
