//! # Structured Logging
//!
//! Subscriber setup and span macros. `RUST_LOG` overrides the configured
//! level; JSON output is enabled with `observability.json_logs`.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{AppConfig, ObservabilityConfig};
use crate::errors::{Result, VaultkeeperError};

/// Create a tracing span for a backend call.
///
/// ```rust,ignore
/// let span = backend_span!("access_version", "projects/p/secrets/db-password");
/// ```
#[macro_export]
macro_rules! backend_span {
    ($operation:expr, $resource:expr) => {
        tracing::debug_span!(
            "backend_call",
            operation = %$operation,
            resource = %$resource,
            call_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $resource:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "backend_call",
            operation = %$operation,
            resource = %$resource,
            call_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span covering one rotation job
#[macro_export]
macro_rules! rotation_span {
    ($secret:expr, $job_id:expr) => {
        tracing::info_span!(
            "rotation",
            secret = %$secret,
            job_id = %$job_id,
            stage = tracing::field::Empty
        )
    };
    ($secret:expr, $job_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "rotation",
            secret = %$secret,
            job_id = %$job_id,
            stage = tracing::field::Empty,
            $($field)*
        )
    };
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| {
            VaultkeeperError::config(format!("Invalid log level '{}': {}", config.log_level, e))
        })?;

    let result = if config.json_logs {
        fmt().json().with_env_filter(filter).with_current_span(true).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(true).try_init()
    };

    result.map_err(|e| VaultkeeperError::config(format!("Failed to initialize logging: {}", e)))
}

/// Log configuration at startup
pub fn log_config_info(config: &AppConfig) {
    tracing::info!(
        backend = %config.backend.kind,
        project_id = %config.backend.project_id,
        kms_configured = config.kms.key_name.is_some(),
        backup_bucket = %config.backup.bucket,
        cache_enabled = config.cache.enabled,
        access_control = config.access.enabled,
        max_retries = config.retry.max_retries,
        rotation_interval_seconds = config.rotation.schedule_interval_seconds,
        audit_interval_seconds = config.compliance.audit_interval_seconds,
        metrics_enabled = config.observability.enable_metrics,
        "Vaultkeeper configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let _span = backend_span!("get_secret", "projects/p/secrets/api-key");
        let _span = backend_span!("get_secret", "projects/p/secrets/api-key", attempt = 2);
        let _span = rotation_span!("api-key", "job-1");
        let _span = rotation_span!("api-key", "job-1", forced = true);
    }

    #[test]
    fn test_log_config_info() {
        let config = AppConfig::default();
        log_config_info(&config);
    }
}
