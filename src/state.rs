//! Shared application state for Axum handlers and guard layers.
//!
//! Every guard component is constructed once here and shared through `Arc`;
//! there are no process-wide singletons. Tests build a state with their own
//! resolver, store and clock via [`AppState::with_components`].
//!
//! # Structured Concurrency
//!
//! The expired-window sweep runs on a `tokio_util::task::TaskTracker` and
//! stops on a `CancellationToken`. Call `shutdown()` before exit to stop it
//! and to flush pending usage/security writes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::identity::{IdentityResolver, resolver_from_config};
use crate::key_detector::KeyDetector;
use crate::metrics;
use crate::middleware::{AuthFailureThrottle, OriginPolicy, TrustedProxies};
use crate::rate_limit::RateLimiter;
use crate::sanitize::Sanitizer;
use crate::tracking::{EventStore, JsonLinesStore, Tracker};

/// Shared application state.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Fixed-window counters for every bucket
    pub rate_limiter: Arc<RateLimiter>,
    /// Who is calling
    pub identity: Arc<dyn IdentityResolver>,
    /// Whether a real identity source is behind `identity`
    pub identity_configured: bool,
    /// Per-IP meter of failed identity resolutions (None = disabled)
    pub auth_throttle: Option<Arc<AuthFailureThrottle>>,
    pub trusted_proxies: Arc<TrustedProxies>,
    pub origin_policy: OriginPolicy,
    pub sanitizer: Sanitizer,
    pub key_detector: KeyDetector,
    /// Detached usage/security event recording
    pub tracker: Tracker,
    /// Timestamp when the application started
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build the state described by `config` and start background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `AppError::ConfigError` if the identity resolver or origin policy
    /// cannot be built from the configuration.
    pub fn new(config: Config) -> AppResult<Self> {
        let resolver = resolver_from_config(&config)
            .map_err(|e| AppError::ConfigError(e.to_string()))?;
        let identity_configured = config.identity_configured();
        let store: Option<Arc<dyn EventStore>> = config.event_log_path.as_ref().map(|path| {
            info!(path = %path.display(), "Recording usage and security events");
            Arc::new(JsonLinesStore::new(path)) as Arc<dyn EventStore>
        });

        let mut state = Self::with_components(config, resolver, store, Arc::new(SystemClock))?;
        state.identity_configured = identity_configured;
        Ok(state)
    }

    /// Build a state from explicit collaborators.
    ///
    /// # Errors
    ///
    /// `AppError::ConfigError` if the origin policy cannot be built.
    pub fn with_components(
        config: Config,
        identity: Arc<dyn IdentityResolver>,
        store: Option<Arc<dyn EventStore>>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        let origin_policy = OriginPolicy::from_base_url(&config.app_base_url)?;
        let rate_limiter = Arc::new(RateLimiter::with_clock(
            config.rate_limit_policies.clone(),
            clock,
        ));
        let auth_throttle =
            AuthFailureThrottle::from_limit(config.auth_failure_limit).map(Arc::new);
        let trusted_proxies = Arc::new(TrustedProxies::new(&config.trusted_proxies));
        let sanitizer = Sanitizer::new(config.sanitization_policy());

        let state = Self {
            config: Arc::new(config),
            rate_limiter,
            identity,
            identity_configured: true,
            auth_throttle,
            trusted_proxies,
            origin_policy,
            sanitizer,
            key_detector: KeyDetector::default(),
            tracker: Tracker::new(store),
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_sweep_task();

        Ok(state)
    }

    /// Periodically drop expired rate-limit windows and idle throttle entries.
    fn spawn_sweep_task(&self) {
        let limiter = self.rate_limiter.clone();
        let throttle = self.auth_throttle.clone();
        let period = self.config.rate_limit_sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period.max(Duration::from_millis(1)));
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Rate limit sweep task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = limiter.sweep_expired();
                        if let Some(throttle) = &throttle {
                            throttle.retain_recent();
                        }
                        let remaining = limiter.tracked_keys();
                        metrics::set_tracked_keys(remaining);
                        trace!(removed, remaining, "Swept expired rate limit windows");
                    }
                }
            }

            debug!("Rate limit sweep task shutting down");
        });
    }

    /// Stop background tasks and wait for pending tracking writes.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.tracker.shutdown().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::HeaderIdentityResolver;
    use crate::rate_limit::Bucket;
    use axum::http::HeaderName;

    #[tokio::test]
    async fn test_unconfigured_state_is_not_ready() {
        let state = AppState::new(Config::default()).unwrap();
        assert!(!state.identity_configured);
        assert!(!state.tracker.is_enabled());
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_identity_header_is_config_error() {
        let config = Config {
            identity_header: Some("not a header".to_string()),
            ..Config::default()
        };
        assert!(matches!(AppState::new(config), Err(AppError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_sweep_task_drops_expired_windows() {
        let clock = ManualClock::new(1_700_000_000_000);
        let config = Config {
            rate_limit_sweep_interval: Duration::from_millis(10),
            ..Config::default()
        };
        let state = AppState::with_components(
            config,
            Arc::new(HeaderIdentityResolver::new(HeaderName::from_static("x-user-id"))),
            None,
            Arc::new(clock.clone()),
        )
        .unwrap();

        state.rate_limiter.check("alice", Bucket::GeneralApi);
        assert_eq!(state.rate_limiter.tracked_keys(), 1);

        clock.advance(60_000);
        for _ in 0..100 {
            if state.rate_limiter.tracked_keys() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.rate_limiter.tracked_keys(), 0);

        state.shutdown().await;
    }
}
