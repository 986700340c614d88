//! Prometheus metrics for the request guard.
//!
//! Metrics are exposed via a dedicated HTTP listener (default: `0.0.0.0:9090`).
//! Recording functions are safe to call before or without initialization; the
//! `metrics` facade drops values when no recorder is installed.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `shield_decisions_total` - Guard decisions (labels: check, outcome)
//! - `shield_suspicious_keys_total` - Flagged API keys (labels: reason)
//! - `shield_tracking_failures_total` - Store writes that failed (labels: kind)
//!
//! ## Histograms
//! - `shield_identity_resolve_seconds` - Identity resolver latency (labels: result)
//!
//! ## Gauges
//! - `shield_rate_limit_tracked_keys` - Live (identity, bucket) windows in memory
//!
//! # Usage
//!
//! ```rust,ignore
//! use chat_shield::metrics::{init_metrics, record_decision};
//!
//! init_metrics("0.0.0.0:9090".parse()?)?;
//! record_decision("csrf", "rejected");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const DECISIONS_TOTAL: &str = "shield_decisions_total";
    pub const SUSPICIOUS_KEYS_TOTAL: &str = "shield_suspicious_keys_total";
    pub const TRACKING_FAILURES_TOTAL: &str = "shield_tracking_failures_total";
    pub const IDENTITY_RESOLVE_SECONDS: &str = "shield_identity_resolve_seconds";
    pub const RATE_LIMIT_TRACKED_KEYS: &str = "shield_rate_limit_tracked_keys";
}

/// Initialize the Prometheus metrics exporter.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (port in use, or a
/// recorder is already installed).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::DECISIONS_TOTAL,
        "Guard decisions by check (origin, rate_limit, csrf, ...) and outcome"
    );
    describe_counter!(
        names::SUSPICIOUS_KEYS_TOTAL,
        "API keys flagged as placeholder or synthetic"
    );
    describe_counter!(
        names::TRACKING_FAILURES_TOTAL,
        "Usage or security event writes that failed"
    );
    describe_histogram!(
        names::IDENTITY_RESOLVE_SECONDS,
        "Identity resolver latency in seconds"
    );
    describe_gauge!(
        names::RATE_LIMIT_TRACKED_KEYS,
        "Rate-limit windows currently held in memory"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

/// Record one guard decision.
pub fn record_decision(check: &'static str, outcome: &'static str) {
    counter!(names::DECISIONS_TOTAL, "check" => check, "outcome" => outcome).increment(1);
}

pub fn record_suspicious_key(reason: &'static str) {
    counter!(names::SUSPICIOUS_KEYS_TOTAL, "reason" => reason).increment(1);
}

pub fn record_tracking_failure(kind: &'static str) {
    counter!(names::TRACKING_FAILURES_TOTAL, "kind" => kind).increment(1);
}

pub fn record_identity_resolve(result: &'static str, duration_secs: f64) {
    histogram!(names::IDENTITY_RESOLVE_SECONDS, "result" => result).record(duration_secs);
}

pub fn set_tracked_keys(count: usize) {
    gauge!(names::RATE_LIMIT_TRACKED_KEYS).set(count as f64);
}
