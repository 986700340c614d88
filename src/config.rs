//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with defaults suited
//! to local development. In production, configure via environment variables or
//! a `.env` file.
//!
//! # Security Configuration
//!
//! - `APP_BASE_URL`: The application's own URL; its origin is the only
//!   non-localhost origin allowed to call the API
//! - `IDENTITY_SERVICE_URL` / `IDENTITY_HEADER`: Where caller identity comes
//!   from. With neither set, guarded endpoints answer 503
//! - `TRUSTED_PROXIES`: CIDR ranges whose `X-Forwarded-For` is believed, or
//!   `*` for every peer. Empty means clients are keyed by peer address
//! - `CSRF_COOKIE_SECURE`: Add `Secure` to the issued CSRF cookie (default: true)
//!
//! # Rate Limiting
//!
//! Bucket policies use the form `<limit>/<window_ms>`:
//!
//! - `RATE_LIMIT_GENERAL_API` (default: `60/60000`)
//! - `RATE_LIMIT_API_KEY_OPERATIONS` (default: `10/60000`)
//! - `RATE_LIMIT_API_KEY_TESTS` (default: `5/60000`)
//! - `AUTH_FAILURE_LIMIT`: Failed identity resolutions per IP per minute
//!   before answering 429 (default: 10, 0 = disabled)
//!
//! # Input Limits
//!
//! - `SANITIZE_MAX_STRING_LENGTH` (default: 10000)
//! - `SANITIZE_MAX_DEPTH` (default: 5)
//! - `MAX_REQUEST_BODY_SIZE` (default: 1MB)

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::rate_limit::{Bucket, BucketPolicies, BucketPolicy};
use crate::sanitize::{DEFAULT_MAX_DEPTH, DEFAULT_MAX_STRING_LENGTH, SanitizationPolicy};

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Maximum request body size in bytes (default: 1MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Origin / CSRF Configuration
    // =========================================================================
    /// Public URL of the application. Only its origin is used.
    pub app_base_url: String,

    /// Whether the issued `csrf_token` cookie carries `Secure`
    pub csrf_cookie_secure: bool,

    // =========================================================================
    // Identity Configuration
    // =========================================================================
    /// Session endpoint asked "who is this?" with the caller's credentials
    pub identity_service_url: Option<String>,

    /// Header carrying the caller id when an auth proxy sits in front
    pub identity_header: Option<String>,

    /// Timeout for identity service calls (default: 2 seconds)
    pub identity_timeout: Duration,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Per-bucket limits
    pub rate_limit_policies: BucketPolicies,

    /// How often expired windows are swept from memory (default: 60 seconds)
    pub rate_limit_sweep_interval: Duration,

    /// Failed identity resolutions allowed per IP per minute (0 = unlimited)
    pub auth_failure_limit: u32,

    /// Trusted proxy CIDR ranges for `X-Forwarded-For` handling.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12"),
    /// or `*` to believe every peer.
    /// Default: Empty (forwarded headers ignored, clients keyed by peer address)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Sanitizer Configuration
    // =========================================================================
    /// Characters kept from any string in a payload
    pub sanitize_max_string_length: usize,

    /// Containers nested at or below this depth are emptied
    pub sanitize_max_depth: usize,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// JSONL file receiving usage records and security events (None = no tracking)
    pub event_log_path: Option<PathBuf>,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value fails to parse or the
    /// resulting configuration is inconsistent.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = BucketPolicies::default();
        let rate_limit_policies = defaults
            .clone()
            .with(
                Bucket::GeneralApi,
                Self::parse_policy("RATE_LIMIT_GENERAL_API", defaults.get(Bucket::GeneralApi))?,
            )
            .with(
                Bucket::ApiKeyOperations,
                Self::parse_policy(
                    "RATE_LIMIT_API_KEY_OPERATIONS",
                    defaults.get(Bucket::ApiKeyOperations),
                )?,
            )
            .with(
                Bucket::ApiKeyTests,
                Self::parse_policy(
                    "RATE_LIMIT_API_KEY_TESTS",
                    defaults.get(Bucket::ApiKeyTests),
                )?,
            );

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 1024 * 1024)?,

            // Origin / CSRF
            app_base_url: env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            csrf_cookie_secure: Self::parse_env("CSRF_COOKIE_SECURE", true)?,

            // Identity
            identity_service_url: Self::non_empty("IDENTITY_SERVICE_URL"),
            identity_header: Self::non_empty("IDENTITY_HEADER"),
            identity_timeout: Duration::from_millis(Self::parse_env("IDENTITY_TIMEOUT_MS", 2000)?),

            // Rate limiting
            rate_limit_policies,
            rate_limit_sweep_interval: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS",
                60,
            )?),
            auth_failure_limit: Self::parse_env("AUTH_FAILURE_LIMIT", 10)?,
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES"),

            // Sanitizer
            sanitize_max_string_length: Self::parse_env(
                "SANITIZE_MAX_STRING_LENGTH",
                DEFAULT_MAX_STRING_LENGTH,
            )?,
            sanitize_max_depth: Self::parse_env("SANITIZE_MAX_DEPTH", DEFAULT_MAX_DEPTH)?,

            // Observability
            event_log_path: Self::non_empty("EVENT_LOG_PATH").map(PathBuf::from),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        let base = url::Url::parse(&self.app_base_url)
            .map_err(|e| AppError::ConfigError(format!("APP_BASE_URL is not a URL: {e}")))?;
        if !base.origin().is_tuple() {
            return Err(AppError::ConfigError(format!(
                "APP_BASE_URL ({}) has no http(s) origin",
                self.app_base_url
            )));
        }

        self.rate_limit_policies
            .validate()
            .map_err(|e| AppError::ConfigError(e.to_string()))?;

        if self.rate_limit_sweep_interval.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.sanitize_max_string_length == 0 {
            return Err(AppError::ConfigError(
                "SANITIZE_MAX_STRING_LENGTH must be greater than 0".to_string(),
            ));
        }

        if self.sanitize_max_depth == 0 {
            return Err(AppError::ConfigError(
                "SANITIZE_MAX_DEPTH must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sanitization_policy(&self) -> SanitizationPolicy {
        SanitizationPolicy {
            max_string_length: self.sanitize_max_string_length,
            max_depth: self.sanitize_max_depth,
        }
    }

    /// Check if some identity source is configured.
    pub fn identity_configured(&self) -> bool {
        self.identity_service_url.is_some() || self.identity_header.is_some()
    }

    /// Check if failed-auth throttling is enabled.
    pub fn auth_throttle_enabled(&self) -> bool {
        self.auth_failure_limit > 0
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address, `None` when disabled.
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        self.metrics_enabled()
            .then(|| std::net::SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn parse_policy(name: &str, default: BucketPolicy) -> AppResult<BucketPolicy> {
        match env::var(name) {
            Ok(val) => BucketPolicy::parse(&val)
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn non_empty(name: &str) -> Option<String> {
        env::var(name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Parse a comma-separated list, dropping blanks.
    fn parse_list(name: &str) -> Vec<String> {
        env::var(name)
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_request_body_size: 1024 * 1024,
            app_base_url: "http://localhost:3000".to_string(),
            csrf_cookie_secure: true,
            identity_service_url: None,
            identity_header: None,
            identity_timeout: Duration::from_secs(2),
            rate_limit_policies: BucketPolicies::default(),
            rate_limit_sweep_interval: Duration::from_secs(60),
            auth_failure_limit: 10,
            trusted_proxies: vec![],
            sanitize_max_string_length: DEFAULT_MAX_STRING_LENGTH,
            sanitize_max_depth: DEFAULT_MAX_DEPTH,
            event_log_path: None,
            metrics_port: 9090,
        }
    }
}
