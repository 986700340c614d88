//! Fixed-window rate limiting keyed by `(identity, bucket)`.
//!
//! # Algorithm
//!
//! Each named [`Bucket`] has a [`BucketPolicy`] (`limit` requests per
//! `window_ms`). For every `(identity, bucket)` pair the limiter keeps a
//! counter and the instant its window started:
//!
//! ```text
//! now - window_start >= window_ms  →  count = 0, window_start = now
//! count += 1
//! count >  limit                   →  Limited (429)
//! otherwise                        →  Allowed
//! ```
//!
//! Identities and buckets partition the counter space completely: exhausting
//! one pair never affects another.
//!
//! # Concurrency
//!
//! Counters live in a [`DashMap`]. The read-increment-compare sequence runs
//! while holding the entry's shard write lock, so concurrent requests for the
//! same pair can never under-count.
//!
//! # Memory
//!
//! Expired windows are reset lazily on access. [`RateLimiter::sweep_expired`]
//! drops entries whose window has lapsed; the application state runs it on an
//! interval so keys for identities that stopped calling do not accumulate.

use std::fmt;
use std::sync::Arc;

use axum::http::HeaderMap;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::identity::{Identity, IdentityError, IdentityResolver};

/// Named rate-limit category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    /// Any metered API call (chat completions and the like).
    GeneralApi,
    /// Creating, updating or deleting stored provider keys.
    ApiKeyOperations,
    /// Test calls that spend a provider request to check a key.
    ApiKeyTests,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [
        Bucket::GeneralApi,
        Bucket::ApiKeyOperations,
        Bucket::ApiKeyTests,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::GeneralApi => "general_api",
            Bucket::ApiKeyOperations => "api_key_operations",
            Bucket::ApiKeyTests => "api_key_tests",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors building rate-limit policies.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("invalid bucket policy `{0}`; expected `<limit>/<window_ms>`")]
    InvalidPolicy(String),

    #[error("bucket {0} must have a limit greater than 0")]
    ZeroLimit(Bucket),

    #[error("bucket {0} must have a window greater than 0ms")]
    ZeroWindow(Bucket),
}

/// Limit and window length for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketPolicy {
    pub limit: u32,
    pub window_ms: u64,
}

impl BucketPolicy {
    pub const fn new(limit: u32, window_ms: u64) -> Self {
        Self { limit, window_ms }
    }

    /// Parse the `"<limit>/<window_ms>"` form used in environment overrides.
    pub fn parse(value: &str) -> Result<Self, RateLimitError> {
        let invalid = || RateLimitError::InvalidPolicy(value.to_string());
        let (limit, window) = value.trim().split_once('/').ok_or_else(invalid)?;
        Ok(Self {
            limit: limit.trim().parse().map_err(|_| invalid())?,
            window_ms: window.trim().parse().map_err(|_| invalid())?,
        })
    }

    fn window_i64(&self) -> i64 {
        i64::try_from(self.window_ms).unwrap_or(i64::MAX)
    }
}

/// Policy table, one entry per [`Bucket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPolicies {
    general_api: BucketPolicy,
    api_key_operations: BucketPolicy,
    api_key_tests: BucketPolicy,
}

impl Default for BucketPolicies {
    fn default() -> Self {
        Self {
            general_api: BucketPolicy::new(60, 60_000),
            api_key_operations: BucketPolicy::new(10, 60_000),
            api_key_tests: BucketPolicy::new(5, 60_000),
        }
    }
}

impl BucketPolicies {
    pub fn get(&self, bucket: Bucket) -> BucketPolicy {
        match bucket {
            Bucket::GeneralApi => self.general_api,
            Bucket::ApiKeyOperations => self.api_key_operations,
            Bucket::ApiKeyTests => self.api_key_tests,
        }
    }

    /// Replace the policy for one bucket.
    pub fn with(mut self, bucket: Bucket, policy: BucketPolicy) -> Self {
        match bucket {
            Bucket::GeneralApi => self.general_api = policy,
            Bucket::ApiKeyOperations => self.api_key_operations = policy,
            Bucket::ApiKeyTests => self.api_key_tests = policy,
        }
        self
    }

    pub fn validate(&self) -> Result<(), RateLimitError> {
        for bucket in Bucket::ALL {
            let policy = self.get(bucket);
            if policy.limit == 0 {
                return Err(RateLimitError::ZeroLimit(bucket));
            }
            if policy.window_ms == 0 {
                return Err(RateLimitError::ZeroWindow(bucket));
            }
        }
        Ok(())
    }
}

/// Counter state for one `(identity, bucket)` pair.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u32,
    window_start_ms: i64,
}

/// Quota left after an allowed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub bucket: Bucket,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which the current window ends.
    pub reset_at_ms: i64,
}

/// Details of a rejected request, rendered as the 429 contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitExceeded {
    pub bucket: Bucket,
    pub limit: u32,
    pub retry_after_secs: u64,
    /// Epoch milliseconds at which the current window ends.
    pub reset_at_ms: i64,
}

/// Result of counting one request against an identity's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed(RateLimitStatus),
    Limited(RateLimitExceeded),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed(_))
    }
}

/// Full outcome of the rate-limit gate, identity resolution included.
#[derive(Debug)]
pub enum RateLimitOutcome {
    Allowed {
        identity: Identity,
        status: RateLimitStatus,
    },
    RateLimited {
        identity: Identity,
        exceeded: RateLimitExceeded,
    },
    Unauthenticated,
    ServiceUnavailable(IdentityError),
}

/// In-memory fixed-window rate limiter.
///
/// Constructed explicitly and shared through `Arc`; there is no global
/// instance.
pub struct RateLimiter {
    counters: DashMap<(String, Bucket), WindowCounter>,
    policies: BucketPolicies,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policies", &self.policies)
            .field("tracked_keys", &self.counters.len())
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter reading the wall clock.
    pub fn new(policies: BucketPolicies) -> Self {
        Self::with_clock(policies, Arc::new(SystemClock))
    }

    pub fn with_clock(policies: BucketPolicies, clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            policies,
            clock,
        }
    }

    pub fn policies(&self) -> &BucketPolicies {
        &self.policies
    }

    /// Count one request for `identity_id` against `bucket`.
    pub fn check(&self, identity_id: &str, bucket: Bucket) -> RateLimitDecision {
        let policy = self.policies.get(bucket);
        let window = policy.window_i64();
        let now = self.clock.now_ms();

        // The entry guard holds the shard lock until the decision is made
        let mut entry = self
            .counters
            .entry((identity_id.to_owned(), bucket))
            .or_insert(WindowCounter {
                count: 0,
                window_start_ms: now,
            });
        let counter = entry.value_mut();

        if now.saturating_sub(counter.window_start_ms) >= window {
            trace!(identity = identity_id, %bucket, "Rate limit window reset");
            counter.count = 0;
            counter.window_start_ms = now;
        }
        counter.count = counter.count.saturating_add(1);

        let reset_at_ms = counter.window_start_ms.saturating_add(window);
        if counter.count > policy.limit {
            RateLimitDecision::Limited(RateLimitExceeded {
                bucket,
                limit: policy.limit,
                retry_after_secs: retry_after_secs(reset_at_ms.saturating_sub(now)),
                reset_at_ms,
            })
        } else {
            RateLimitDecision::Allowed(RateLimitStatus {
                bucket,
                limit: policy.limit,
                remaining: policy.limit - counter.count,
                reset_at_ms,
            })
        }
    }

    /// Resolve the caller, then count the request against `bucket`.
    pub async fn rate_limit(
        &self,
        resolver: &dyn IdentityResolver,
        headers: &HeaderMap,
        bucket: Bucket,
    ) -> RateLimitOutcome {
        let identity = match resolver.resolve(headers).await {
            Ok(Some(identity)) => identity,
            Ok(None) => return RateLimitOutcome::Unauthenticated,
            Err(e) => return RateLimitOutcome::ServiceUnavailable(e),
        };

        match self.check(&identity.id, bucket) {
            RateLimitDecision::Allowed(status) => RateLimitOutcome::Allowed { identity, status },
            RateLimitDecision::Limited(exceeded) => {
                RateLimitOutcome::RateLimited { identity, exceeded }
            }
        }
    }

    /// Drop counters whose window has already ended. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.counters.len();
        self.counters.retain(|(_, bucket), counter| {
            now.saturating_sub(counter.window_start_ms) < self.policies.get(*bucket).window_i64()
        });
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed, remaining = self.counters.len(), "Swept expired rate limit windows");
        }
        removed
    }

    /// Number of `(identity, bucket)` pairs currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }

    /// Forget every counter.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

/// Whole seconds until `remaining_ms` elapses, rounded up, never below 1.
fn retry_after_secs(remaining_ms: i64) -> u64 {
    let remaining = u64::try_from(remaining_ms).unwrap_or(0);
    remaining.div_ceil(1000).max(1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::{HeaderIdentityResolver, UnconfiguredIdentityResolver};
    use axum::http::HeaderName;

    const T0: i64 = 1_700_000_000_000;

    fn limiter() -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(T0);
        let limiter = RateLimiter::with_clock(BucketPolicies::default(), Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn test_general_api_allows_sixty_then_limits() {
        let (limiter, _clock) = limiter();

        for n in 1..=60 {
            let decision = limiter.check("alice", Bucket::GeneralApi);
            assert!(decision.is_allowed(), "request {n} should be allowed");
        }

        match limiter.check("alice", Bucket::GeneralApi) {
            RateLimitDecision::Limited(exceeded) => {
                assert_eq!(exceeded.limit, 60);
                assert_eq!(exceeded.retry_after_secs, 60);
                assert_eq!(exceeded.reset_at_ms, T0 + 60_000);
            }
            other => panic!("expected limit, got {other:?}"),
        }
    }

    #[test]
    fn test_remaining_counts_down() {
        let (limiter, _clock) = limiter();

        let RateLimitDecision::Allowed(first) = limiter.check("bob", Bucket::ApiKeyTests) else {
            panic!("first request must pass");
        };
        assert_eq!(first.remaining, 4);

        for _ in 0..4 {
            limiter.check("bob", Bucket::ApiKeyTests);
        }
        assert!(!limiter.check("bob", Bucket::ApiKeyTests).is_allowed());
    }

    #[test]
    fn test_window_resets_exactly_at_boundary() {
        let (limiter, clock) = limiter();
        for _ in 0..=60 {
            limiter.check("alice", Bucket::GeneralApi);
        }
        assert!(!limiter.check("alice", Bucket::GeneralApi).is_allowed());

        clock.advance(59_999);
        assert!(!limiter.check("alice", Bucket::GeneralApi).is_allowed());

        clock.advance(1);
        let decision = limiter.check("alice", Bucket::GeneralApi);
        let RateLimitDecision::Allowed(status) = decision else {
            panic!("window should have reset, got {decision:?}");
        };
        assert_eq!(status.remaining, 59);
        assert_eq!(status.reset_at_ms, T0 + 60_000 + 60_000);
    }

    #[test]
    fn test_retry_after_shrinks_with_time() {
        let (limiter, clock) = limiter();
        for _ in 0..5 {
            limiter.check("carol", Bucket::ApiKeyTests);
        }
        clock.advance(58_500);

        let RateLimitDecision::Limited(exceeded) = limiter.check("carol", Bucket::ApiKeyTests)
        else {
            panic!("expected limit");
        };
        assert_eq!(exceeded.retry_after_secs, 2);
    }

    #[test]
    fn test_identities_are_independent() {
        let (limiter, _clock) = limiter();
        for _ in 0..61 {
            limiter.check("alice", Bucket::GeneralApi);
        }
        assert!(!limiter.check("alice", Bucket::GeneralApi).is_allowed());
        assert!(limiter.check("bob", Bucket::GeneralApi).is_allowed());
    }

    #[test]
    fn test_buckets_are_independent() {
        let (limiter, _clock) = limiter();
        for _ in 0..10 {
            assert!(limiter.check("alice", Bucket::ApiKeyOperations).is_allowed());
        }
        assert!(!limiter.check("alice", Bucket::ApiKeyOperations).is_allowed());
        assert!(limiter.check("alice", Bucket::GeneralApi).is_allowed());
        assert!(limiter.check("alice", Bucket::ApiKeyTests).is_allowed());
    }

    #[test]
    fn test_sweep_removes_only_expired_windows() {
        let (limiter, clock) = limiter();
        limiter.check("old", Bucket::GeneralApi);
        clock.advance(30_000);
        limiter.check("fresh", Bucket::GeneralApi);
        assert_eq!(limiter.tracked_keys(), 2);

        clock.advance(30_000);
        assert_eq!(limiter.sweep_expired(), 1);
        assert_eq!(limiter.tracked_keys(), 1);

        limiter.clear();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_concurrent_checks_never_undercount() {
        let (limiter, _clock) = limiter();
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .filter(|_| limiter.check("shared", Bucket::GeneralApi).is_allowed())
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 60);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            BucketPolicy::parse(" 120 / 30000 ").unwrap(),
            BucketPolicy::new(120, 30_000)
        );
        assert!(BucketPolicy::parse("120").is_err());
        assert!(BucketPolicy::parse("a/b").is_err());
    }

    #[test]
    fn test_policies_validate_rejects_zero() {
        let policies = BucketPolicies::default().with(Bucket::ApiKeyTests, BucketPolicy::new(0, 1));
        assert_eq!(
            policies.validate(),
            Err(RateLimitError::ZeroLimit(Bucket::ApiKeyTests))
        );

        let policies =
            BucketPolicies::default().with(Bucket::GeneralApi, BucketPolicy::new(1, 0));
        assert_eq!(
            policies.validate(),
            Err(RateLimitError::ZeroWindow(Bucket::GeneralApi))
        );
    }

    #[tokio::test]
    async fn test_rate_limit_distinguishes_resolver_outcomes() {
        let (limiter, _clock) = limiter();
        let resolver = HeaderIdentityResolver::new(HeaderName::from_static("x-user-id"));

        let outcome = limiter
            .rate_limit(&resolver, &HeaderMap::new(), Bucket::GeneralApi)
            .await;
        assert!(matches!(outcome, RateLimitOutcome::Unauthenticated));

        let outcome = limiter
            .rate_limit(
                &UnconfiguredIdentityResolver,
                &HeaderMap::new(),
                Bucket::GeneralApi,
            )
            .await;
        assert!(matches!(outcome, RateLimitOutcome::ServiceUnavailable(_)));

        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "dana".parse().unwrap());
        let outcome = limiter
            .rate_limit(&resolver, &headers, Bucket::GeneralApi)
            .await;
        match outcome {
            RateLimitOutcome::Allowed { identity, status } => {
                assert_eq!(identity.id, "dana");
                assert_eq!(status.remaining, 59);
            }
            other => panic!("expected allowed, got {other:?}"),
        }
        // Unauthenticated calls never create counters
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
