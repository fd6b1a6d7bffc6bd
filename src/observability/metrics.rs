//! # Metrics Collection
//!
//! Prometheus metrics for backend calls, retries, caching, rotation and
//! compliance. The recorder is a cheap handle passed to every component;
//! recording without an installed exporter is a no-op.

use crate::config::ObservabilityConfig;
use crate::errors::{Result, VaultkeeperError};
use ::tracing::{info, warn};
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub const BACKEND_CALLS_TOTAL: &str = "vaultkeeper_backend_calls_total";
pub const BACKEND_CALL_DURATION: &str = "vaultkeeper_backend_call_duration_seconds";
pub const RETRIES_TOTAL: &str = "vaultkeeper_retries_total";
pub const RATE_LIMIT_WAIT: &str = "vaultkeeper_rate_limit_wait_seconds";
pub const CACHE_LOOKUPS_TOTAL: &str = "vaultkeeper_cache_lookups_total";
pub const ROTATIONS_TOTAL: &str = "vaultkeeper_rotations_total";
pub const COMPLIANCE_VIOLATIONS_TOTAL: &str = "vaultkeeper_compliance_violations_total";
pub const CREDENTIAL_FALLBACKS_TOTAL: &str = "vaultkeeper_credential_fallbacks_total";
pub const SECRET_ACCESSES_TOTAL: &str = "vaultkeeper_secret_accesses_total";

/// Metrics recorder handed to each component
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Record one backend attempt and how long it took
    pub fn record_backend_call(&self, operation: &str, outcome: &str, duration: f64) {
        let labels = [("operation", operation.to_string()), ("outcome", outcome.to_string())];
        counter!(BACKEND_CALLS_TOTAL, &labels).increment(1);

        let duration_labels = [("operation", operation.to_string())];
        histogram!(BACKEND_CALL_DURATION, &duration_labels).record(duration);
    }

    pub fn record_retry(&self, operation: &str) {
        let labels = [("operation", operation.to_string())];
        counter!(RETRIES_TOTAL, &labels).increment(1);
    }

    pub fn record_rate_limit_wait(&self, seconds: f64) {
        histogram!(RATE_LIMIT_WAIT).record(seconds);
    }

    pub fn record_cache_lookup(&self, cache: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        let labels = [("cache", cache.to_string()), ("result", result.to_string())];
        counter!(CACHE_LOOKUPS_TOTAL, &labels).increment(1);
    }

    /// Record a finished rotation: `committed`, `rolled_back`, `rollback_failed` or `rejected`
    pub fn record_rotation(&self, outcome: &str) {
        let labels = [("outcome", outcome.to_string())];
        counter!(ROTATIONS_TOTAL, &labels).increment(1);
    }

    pub fn record_compliance_violation(&self, check: &str, severity: &str) {
        let labels = [("check", check.to_string()), ("severity", severity.to_string())];
        counter!(COMPLIANCE_VIOLATIONS_TOTAL, &labels).increment(1);
    }

    /// Record a downgrade to a less secure credential path (IMDSv1)
    pub fn record_credential_fallback(&self, provider: &str) {
        let labels = [("provider", provider.to_string())];
        counter!(CREDENTIAL_FALLBACKS_TOTAL, &labels).increment(1);
    }

    /// Record a guarded payload read: `granted`, `denied` or `failed`
    pub fn record_secret_access(&self, outcome: &str) {
        let labels = [("outcome", outcome.to_string())];
        counter!(SECRET_ACCESSES_TOTAL, &labels).increment(1);
    }

    pub fn register_metrics(&self) {
        describe_counter!(BACKEND_CALLS_TOTAL, Unit::Count, "Backend call attempts by outcome");
        describe_histogram!(
            BACKEND_CALL_DURATION,
            Unit::Seconds,
            "Latency of individual backend call attempts"
        );
        describe_counter!(RETRIES_TOTAL, Unit::Count, "Retries scheduled after transient errors");
        describe_histogram!(
            RATE_LIMIT_WAIT,
            Unit::Seconds,
            "Time spent waiting for a rate-limiter token"
        );
        describe_counter!(CACHE_LOOKUPS_TOTAL, Unit::Count, "Response cache hits and misses");
        describe_counter!(ROTATIONS_TOTAL, Unit::Count, "Secret rotations by final outcome");
        describe_counter!(
            COMPLIANCE_VIOLATIONS_TOTAL,
            Unit::Count,
            "Compliance violations found by check and severity"
        );
        describe_counter!(
            CREDENTIAL_FALLBACKS_TOTAL,
            Unit::Count,
            "Credential fetches that fell back to a legacy path"
        );
        describe_counter!(SECRET_ACCESSES_TOTAL, Unit::Count, "Guarded secret reads by outcome");
    }
}

/// Install the Prometheus exporter when metrics are enabled
pub fn init_metrics(config: &ObservabilityConfig) -> Result<MetricsRecorder> {
    let recorder = MetricsRecorder::new();
    if !config.enable_metrics {
        return Ok(recorder);
    }

    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(recorder);
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        VaultkeeperError::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| {
            VaultkeeperError::config(format!("Failed to initialize metrics exporter: {}", e))
        })?;

    recorder.register_metrics();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );

    Ok(recorder)
}
