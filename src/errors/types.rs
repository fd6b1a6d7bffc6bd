//! # Error Types
//!
//! Error taxonomy for vaultkeeper using `thiserror`.
//!
//! - **Transient** failures (timeouts, throttling, 5xx) are retried by the
//!   retry executor and surface as [`VaultkeeperError::RetriesExhausted`] once
//!   the attempt budget is spent.
//! - **Integrity** failures (checksum mismatch, unverifiable checksum, AEAD tag
//!   failure) are never retried.
//! - **Policy** outcomes (rotation too soon, rotation already running, access
//!   denied) are reported to the caller to act on.
//! - **State-machine** failures carry the stage they happened in; a failed
//!   rollback carries both causes and is flagged for manual intervention.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::domain::{CredentialSourceKind, DenialReason, RotationState};

/// Result type for vaultkeeper operations
pub type Result<T> = std::result::Result<T, VaultkeeperError>;

/// Coarse classification used for logging, metrics and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Integrity,
    Policy,
    StateMachine,
    CredentialSource,
    Cancelled,
    NotFound,
    Config,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Integrity => "integrity",
            Self::Policy => "policy",
            Self::StateMachine => "state_machine",
            Self::CredentialSource => "credential_source",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn fmt_checksum(value: &Option<u32>) -> String {
    match value {
        Some(v) => format!("{:#010x}", v),
        None => "none".to_string(),
    }
}

/// Main error type for vaultkeeper
#[derive(thiserror::Error, Debug)]
pub enum VaultkeeperError {
    /// A call to a backend (secret store, KMS, object storage) failed
    #[error("{operation} on '{resource}' failed: {message}")]
    Backend { operation: String, resource: String, message: String, retryable: bool },

    /// The retry budget was spent; wraps the last underlying error
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<VaultkeeperError>,
    },

    /// Checksum mismatch or an integrity check that could not be performed
    #[error(
        "Integrity violation during {operation} on '{resource}': expected {}, got {}",
        fmt_checksum(.expected),
        fmt_checksum(.actual)
    )]
    IntegrityViolation {
        operation: String,
        resource: String,
        expected: Option<u32>,
        actual: Option<u32>,
    },

    /// The payload could not be authenticated or parsed as an envelope
    #[error("Corrupted envelope during {operation}: {message}")]
    CorruptedEnvelope { operation: String, message: String },

    /// No KMS key is configured; plaintext fallback is never attempted
    #[error("Encryption unavailable for {operation}: no KMS key configured")]
    EncryptionUnavailable { operation: String },

    /// A credential was resolved but is expired or inside the grace window
    #[error("Credential from {source_kind} source expired at {expires_at}")]
    CredentialExpired { source_kind: CredentialSourceKind, expires_at: DateTime<Utc> },

    /// A credential source could not produce a token
    #[error("{source_kind} credential source failed: {message}")]
    CredentialSource {
        source_kind: CredentialSourceKind,
        message: String,
        /// Captured stderr for executable sources
        stderr: Option<String>,
    },

    /// Unforced rotation attempted before the policy period elapsed
    #[error("Rotation of '{secret}' is too soon; next allowed at {next_allowed_at}")]
    RotationTooSoon { secret: String, next_allowed_at: DateTime<Utc> },

    /// Another rotation of the same secret holds the per-secret lock
    #[error("Rotation of '{secret}' is already in progress")]
    RotationInProgress { secret: String },

    /// The principal may not read this secret's payload right now
    #[error("Access to '{secret}' denied for '{principal}': {reason}")]
    AccessDenied { secret: String, principal: String, reason: DenialReason },

    /// A stage failed; rollback (if one was needed) succeeded
    #[error("Rotation of '{secret}' failed in {stage}: {source}")]
    RotationFailed {
        secret: String,
        stage: RotationState,
        #[source]
        source: Box<VaultkeeperError>,
    },

    /// A stage failed and the rollback failed too
    #[error(
        "Rollback of '{secret}' failed after {stage} failure; manual intervention required. \
         Cause: {cause}. Rollback error: {rollback_error}"
    )]
    RollbackFailed {
        secret: String,
        stage: RotationState,
        cause: Box<VaultkeeperError>,
        #[source]
        rollback_error: Box<VaultkeeperError>,
    },

    /// The caller cancelled the operation or its deadline passed
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    #[error("Resource not found: {resource_type} '{id}'")]
    NotFound { resource_type: String, id: String },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl VaultkeeperError {
    /// Create a backend error
    pub fn backend(
        operation: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::Backend {
            operation: operation.into(),
            resource: resource.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Create a retryable backend error (timeouts, throttling, 5xx)
    pub fn transient(
        operation: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::backend(operation, resource, message, true)
    }

    /// Map an HTTP error status returned by a backend
    pub fn from_status(
        operation: impl Into<String>,
        resource: impl Into<String>,
        status: u16,
        body: &str,
    ) -> Self {
        let resource = resource.into();
        if status == 404 {
            return Self::not_found("resource", resource);
        }
        let retryable = matches!(status, 408 | 429 | 500 | 502 | 503 | 504);
        let message = format!("HTTP {}: {}", status, body.chars().take(512).collect::<String>());
        Self::backend(operation, resource, message, retryable)
    }

    /// Map a transport-level reqwest failure
    pub fn from_reqwest(
        operation: impl Into<String>,
        resource: impl Into<String>,
        error: &reqwest::Error,
    ) -> Self {
        let retryable = error.is_timeout() || error.is_connect() || error.is_request();
        Self::backend(operation, resource, error.to_string(), retryable)
    }

    pub fn integrity(
        operation: impl Into<String>,
        resource: impl Into<String>,
        expected: Option<u32>,
        actual: Option<u32>,
    ) -> Self {
        Self::IntegrityViolation {
            operation: operation.into(),
            resource: resource.into(),
            expected,
            actual,
        }
    }

    pub fn corrupted(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptedEnvelope { operation: operation.into(), message: message.into() }
    }

    pub fn encryption_unavailable(operation: impl Into<String>) -> Self {
        Self::EncryptionUnavailable { operation: operation.into() }
    }

    pub fn credential_source(
        source_kind: CredentialSourceKind,
        message: impl Into<String>,
    ) -> Self {
        Self::CredentialSource { source_kind, message: message.into(), stderr: None }
    }

    pub fn credential_source_with_stderr(
        source_kind: CredentialSourceKind,
        message: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        let stderr = stderr.into();
        let stderr = (!stderr.trim().is_empty()).then_some(stderr);
        Self::CredentialSource { source_kind, message: message.into(), stderr }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled { operation: operation.into() }
    }

    pub fn access_denied(
        secret: impl Into<String>,
        principal: impl Into<String>,
        reason: DenialReason,
    ) -> Self {
        Self::AccessDenied { secret: secret.into(), principal: principal.into(), reason }
    }

    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { retryable, .. } => *retryable,
            Self::Io { .. } => true,
            _ => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Backend { retryable: true, .. } | Self::Io { .. } => ErrorCategory::Transient,
            Self::Backend { retryable: false, .. } | Self::RetriesExhausted { .. } => {
                ErrorCategory::Permanent
            }
            Self::IntegrityViolation { .. } | Self::CorruptedEnvelope { .. } => {
                ErrorCategory::Integrity
            }
            Self::RotationTooSoon { .. }
            | Self::RotationInProgress { .. }
            | Self::AccessDenied { .. } => ErrorCategory::Policy,
            Self::RotationFailed { .. } | Self::RollbackFailed { .. } => {
                ErrorCategory::StateMachine
            }
            Self::CredentialExpired { .. } | Self::CredentialSource { .. } => {
                ErrorCategory::CredentialSource
            }
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Config { .. } | Self::Validation { .. } | Self::EncryptionUnavailable { .. } => {
                ErrorCategory::Config
            }
            Self::Serialization { .. } | Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// True when the secret may be left in an inconsistent state
    pub fn requires_manual_intervention(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }

    /// True for checksum and envelope failures, looking through wrappers
    pub fn is_integrity_violation(&self) -> bool {
        match self {
            Self::IntegrityViolation { .. } | Self::CorruptedEnvelope { .. } => true,
            Self::RetriesExhausted { source, .. } | Self::RotationFailed { source, .. } => {
                source.is_integrity_violation()
            }
            _ => false,
        }
    }

    /// True for cancellation, looking through wrappers
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::RetriesExhausted { source, .. } | Self::RotationFailed { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }

    /// Name of the operation that failed, when recorded
    pub fn operation(&self) -> Option<&str> {
        match self {
            Self::Backend { operation, .. }
            | Self::RetriesExhausted { operation, .. }
            | Self::IntegrityViolation { operation, .. }
            | Self::CorruptedEnvelope { operation, .. }
            | Self::EncryptionUnavailable { operation }
            | Self::Cancelled { operation } => Some(operation),
            Self::RotationFailed { .. } | Self::RollbackFailed { .. } => Some("rotate"),
            _ => None,
        }
    }

    /// Identity of the resource involved, when recorded
    pub fn resource(&self) -> Option<&str> {
        match self {
            Self::Backend { resource, .. } | Self::IntegrityViolation { resource, .. } => {
                Some(resource)
            }
            Self::RetriesExhausted { source, .. } => source.resource(),
            Self::RotationTooSoon { secret, .. }
            | Self::RotationInProgress { secret }
            | Self::AccessDenied { secret, .. }
            | Self::RotationFailed { secret, .. }
            | Self::RollbackFailed { secret, .. } => Some(secret),
            Self::NotFound { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl From<std::io::Error> for VaultkeeperError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_json::Error> for VaultkeeperError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON serialization failed".to_string() }
    }
}

impl From<toml::de::Error> for VaultkeeperError {
    fn from(error: toml::de::Error) -> Self {
        Self::config_with_source("Failed to parse configuration file", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for VaultkeeperError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| {
                        e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string())
                    })
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        // Nested sections only report through the Display impl.
        let message = if message.is_empty() { errors.to_string() } else { message };
        Self::validation(format!("Validation failed: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_context() {
        let err = VaultkeeperError::transient("access_version", "projects/p/secrets/s", "timeout");
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert_eq!(err.operation(), Some("access_version"));
        assert_eq!(err.resource(), Some("projects/p/secrets/s"));
        assert_eq!(err.to_string(), "access_version on 'projects/p/secrets/s' failed: timeout");
    }

    #[test]
    fn test_status_mapping() {
        assert!(VaultkeeperError::from_status("op", "r", 503, "unavailable").is_retryable());
        assert!(VaultkeeperError::from_status("op", "r", 429, "slow down").is_retryable());
        assert!(!VaultkeeperError::from_status("op", "r", 403, "denied").is_retryable());
        assert!(matches!(
            VaultkeeperError::from_status("op", "r", 404, ""),
            VaultkeeperError::NotFound { .. }
        ));
    }

    #[test]
    fn test_integrity_never_retryable() {
        let err = VaultkeeperError::integrity("decrypt", "key", Some(1), Some(2));
        assert!(!err.is_retryable());
        assert!(err.is_integrity_violation());
        assert_eq!(err.category(), ErrorCategory::Integrity);
        assert!(err.to_string().contains("0x00000001"));

        let unverifiable = VaultkeeperError::integrity("decrypt", "key", Some(1), None);
        assert!(unverifiable.to_string().contains("got none"));
    }

    #[test]
    fn test_retries_exhausted_wraps_last_error() {
        let last = VaultkeeperError::transient("list_versions", "s", "503");
        let err = VaultkeeperError::RetriesExhausted {
            operation: "list_versions".into(),
            attempts: 5,
            source: Box::new(last),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.resource(), Some("s"));
        assert!(err.to_string().contains("after 5 attempts"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_rollback_failure_flags_manual_intervention() {
        let err = VaultkeeperError::RollbackFailed {
            secret: "db-password".into(),
            stage: RotationState::Testing,
            cause: Box::new(VaultkeeperError::internal("probe failed")),
            rollback_error: Box::new(VaultkeeperError::transient("put_object", "b", "down")),
        };
        assert!(err.requires_manual_intervention());
        assert_eq!(err.category(), ErrorCategory::StateMachine);
        let text = err.to_string();
        assert!(text.contains("probe failed"));
        assert!(text.contains("down"));
        assert!(text.contains("TESTING"));
    }

    #[test]
    fn test_credential_errors_carry_source() {
        let err = VaultkeeperError::credential_source_with_stderr(
            CredentialSourceKind::Executable,
            "exit status 3",
            "permission denied",
        );
        assert_eq!(err.category(), ErrorCategory::CredentialSource);
        assert!(err.to_string().starts_with("EXECUTABLE"));
        if let VaultkeeperError::CredentialSource { stderr, .. } = err {
            assert_eq!(stderr.as_deref(), Some("permission denied"));
        }
    }

    #[test]
    fn test_cancelled_seen_through_wrappers() {
        let err = VaultkeeperError::RetriesExhausted {
            operation: "op".into(),
            attempts: 1,
            source: Box::new(VaultkeeperError::cancelled("op")),
        };
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: VaultkeeperError = io_error.into();
        assert!(matches!(err, VaultkeeperError::Io { .. }));

        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: VaultkeeperError = json_error.into();
        assert!(matches!(err, VaultkeeperError::Serialization { .. }));
    }
}
