//! Identity resolution collaborator.
//!
//! The guard never authenticates users itself. It asks an [`IdentityResolver`]
//! who is making the request and keys rate-limit counters by the answer.
//!
//! Three outcomes are distinct and must stay distinct:
//!
//! | Resolver result            | Guard decision          |
//! |----------------------------|-------------------------|
//! | `Ok(Some(identity))`       | count against buckets   |
//! | `Ok(None)`                 | 401 Authentication required |
//! | `Err(IdentityError)`       | 503 service unavailable |
//!
//! # Implementations
//!
//! - [`HeaderIdentityResolver`]: trusts a header injected by an upstream auth proxy
//! - [`RemoteIdentityResolver`]: asks an auth service over HTTP
//! - [`UnconfiguredIdentityResolver`]: always unavailable, so a deployment
//!   without identity configuration fails closed

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;

/// An already-authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// The resolver could not answer. Distinct from "no identity".
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("no identity resolver is configured")]
    NotConfigured,

    #[error("invalid identity resolver configuration: {0}")]
    InvalidConfig(String),

    #[error("identity service unreachable: {0}")]
    Unreachable(String),

    #[error("identity service returned unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("identity service returned an invalid body: {0}")]
    InvalidResponse(String),
}

/// Boxed future returned by [`IdentityResolver::resolve`].
pub type ResolveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Identity>, IdentityError>> + Send + 'a>>;

/// Resolves the caller of a request from its headers.
pub trait IdentityResolver: Send + Sync {
    fn resolve<'a>(&'a self, headers: &'a HeaderMap) -> ResolveFuture<'a>;
}

/// Reads the identity from a header set by a trusted upstream proxy.
///
/// Only safe when clients cannot reach the service without passing through
/// that proxy, which must strip any client-supplied copy of the header.
#[derive(Debug, Clone)]
pub struct HeaderIdentityResolver {
    header: HeaderName,
}

impl HeaderIdentityResolver {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl IdentityResolver for HeaderIdentityResolver {
    fn resolve<'a>(&'a self, headers: &'a HeaderMap) -> ResolveFuture<'a> {
        Box::pin(async move {
            let Some(value) = headers.get(&self.header) else {
                return Ok(None);
            };
            match value.to_str().map(str::trim) {
                Ok(id) if !id.is_empty() => Ok(Some(Identity::new(id))),
                Ok(_) => Ok(None),
                Err(_) => {
                    debug!(header = %self.header, "Identity header is not visible ASCII");
                    Ok(None)
                }
            }
        })
    }
}

/// Asks a session/auth service who the caller is.
///
/// Forwards the caller's `Authorization` and `Cookie` headers with a `GET` to
/// the configured endpoint and interprets the answer:
///
/// - `2xx` with `{"id": "..."}` → identity
/// - `401`, `403`, `404` → no identity
/// - a `2xx` body without a non-empty `id`, any other status, transport
///   error or timeout → unavailable
#[derive(Debug, Clone)]
pub struct RemoteIdentityResolver {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl RemoteIdentityResolver {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, IdentityError> {
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| IdentityError::InvalidConfig(format!("IDENTITY_SERVICE_URL: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::InvalidConfig(e.to_string()))?;
        Ok(Self { client, endpoint })
    }
}

impl IdentityResolver for RemoteIdentityResolver {
    fn resolve<'a>(&'a self, headers: &'a HeaderMap) -> ResolveFuture<'a> {
        Box::pin(async move {
            let authorization = headers.get(AUTHORIZATION);
            let cookie = headers.get(COOKIE);
            if authorization.is_none() && cookie.is_none() {
                // Nothing to present, the answer can only be "anonymous"
                return Ok(None);
            }

            let mut request = self.client.get(self.endpoint.clone());
            if let Some(value) = authorization {
                request = request.header(AUTHORIZATION, value.clone());
            }
            if let Some(value) = cookie {
                request = request.header(COOKIE, value.clone());
            }

            let response = request.send().await.map_err(|e| {
                warn!(error = %e, endpoint = %self.endpoint, "Identity service request failed");
                IdentityError::Unreachable(e.to_string())
            })?;

            match response.status() {
                s if s.is_success() => {
                    let identity = response
                        .json::<Identity>()
                        .await
                        .map_err(|e| IdentityError::InvalidResponse(e.to_string()))?;
                    if identity.id.trim().is_empty() {
                        return Err(IdentityError::InvalidResponse("empty id".to_string()));
                    }
                    Ok(Some(identity))
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                    Ok(None)
                }
                other => Err(IdentityError::UnexpectedStatus(other.as_u16())),
            }
        })
    }
}

/// Resolver used when no identity source is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredIdentityResolver;

impl IdentityResolver for UnconfiguredIdentityResolver {
    fn resolve<'a>(&'a self, _headers: &'a HeaderMap) -> ResolveFuture<'a> {
        Box::pin(async { Err(IdentityError::NotConfigured) })
    }
}

/// Pick the resolver described by the configuration.
///
/// `IDENTITY_SERVICE_URL` wins over `IDENTITY_HEADER`; with neither set every
/// guarded request answers 503.
pub fn resolver_from_config(config: &Config) -> Result<Arc<dyn IdentityResolver>, IdentityError> {
    if let Some(url) = &config.identity_service_url {
        return Ok(Arc::new(RemoteIdentityResolver::new(
            url,
            config.identity_timeout,
        )?));
    }

    if let Some(header) = &config.identity_header {
        let name = HeaderName::try_from(header.as_str())
            .map_err(|e| IdentityError::InvalidConfig(format!("IDENTITY_HEADER: {e}")))?;
        return Ok(Arc::new(HeaderIdentityResolver::new(name)));
    }

    warn!("No identity resolver configured; guarded endpoints will answer 503");
    Ok(Arc::new(UnconfiguredIdentityResolver))
}
