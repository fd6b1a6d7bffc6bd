//! # Configuration Settings
//!
//! Configuration structure for vaultkeeper. Values come from defaults, an
//! optional TOML file, then `VAULTKEEPER_*` environment overrides.

use crate::credentials::{CredentialSource, MetadataProvider, MetadataSource};
use crate::domain::AccessPolicy;
use crate::errors::{Result, VaultkeeperError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "VAULTKEEPER_";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct AppConfig {
    #[validate(nested)]
    pub backend: BackendConfig,

    pub kms: KmsConfig,

    #[validate(nested)]
    pub backup: BackupConfig,

    #[validate(nested)]
    pub retry: RetryConfig,

    #[validate(nested)]
    pub rate_limit: RateLimitConfig,

    #[validate(nested)]
    pub cache: CacheConfig,

    #[validate(nested)]
    pub credentials: CredentialsConfig,

    #[validate(nested)]
    pub rotation: RotationConfig,

    #[validate(nested)]
    pub compliance: ComplianceConfig,

    #[validate(nested)]
    pub access: AccessConfig,

    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| VaultkeeperError::Io {
            source: e,
            context: format!("Failed to read config file: {}", path.display()),
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(VaultkeeperError::from)?;
        self.validate_custom()?;
        Ok(())
    }

    /// Cross-field checks the validator derive cannot express
    fn validate_custom(&self) -> Result<()> {
        if self.backend.kind == BackendKind::Gcp {
            if self.backend.project_id.trim().is_empty() {
                return Err(VaultkeeperError::validation_field(
                    "project_id is required for the gcp backend",
                    "backend.project_id",
                ));
            }
            if self.credentials.source.is_none() {
                return Err(VaultkeeperError::validation_field(
                    "A credential source is required for the gcp backend",
                    "credentials.source",
                ));
            }
        }

        if let Some(source) = &self.credentials.source {
            source.validate()?;
        }

        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(VaultkeeperError::validation_field(
                "max_backoff_ms must not be smaller than initial_backoff_ms",
                "retry.max_backoff_ms",
            ));
        }

        for (secret, policy) in &self.access.policies {
            let invalid = policy.invalid_time_entries();
            if !invalid.is_empty() {
                return Err(VaultkeeperError::validation_field(
                    format!("Out-of-range time restriction: {}", invalid.join(", ")),
                    format!("access.policies.{}", secret),
                ));
            }
        }

        if self.backup.encrypt && self.kms.key_name.is_none() {
            tracing::warn!("Backup encryption enabled without a KMS key; backups will fail");
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(kind) = env_parse::<BackendKind>("BACKEND")? {
            self.backend.kind = kind;
        }
        if let Some(project) = env_var("PROJECT_ID") {
            self.backend.project_id = project;
        }
        if let Some(key) = env_var("KMS_KEY_NAME") {
            self.kms.key_name = Some(key);
        }
        if let Some(bucket) = env_var("BACKUP_BUCKET") {
            self.backup.bucket = bucket;
        }
        if let Some(encrypt) = env_parse("BACKUP_ENCRYPT")? {
            self.backup.encrypt = encrypt;
        }
        if let Some(retries) = env_parse("MAX_RETRIES")? {
            self.retry.max_retries = retries;
        }
        if let Some(rate) = env_parse("RATE_LIMIT_PER_SECOND")? {
            self.rate_limit.refill_per_second = rate;
        }
        if let Some(enabled) = env_parse("CACHE_ENABLED")? {
            self.cache.enabled = enabled;
        }
        if let Some(enabled) = env_parse("ACCESS_CONTROL_ENABLED")? {
            self.access.enabled = enabled;
        }
        if let Some(principal) = env_var("SERVICE_PRINCIPAL") {
            self.access.service_principal = principal;
        }
        if let Some(provider) = env_var("METADATA_PROVIDER") {
            let provider = match provider.to_ascii_lowercase().as_str() {
                "aws" => MetadataProvider::Aws,
                "azure" => MetadataProvider::Azure,
                "gcp" => MetadataProvider::Gcp,
                other => {
                    return Err(VaultkeeperError::config(format!(
                        "Invalid {}METADATA_PROVIDER '{}'",
                        ENV_PREFIX, other
                    )))
                }
            };
            self.credentials.source =
                Some(CredentialSource::MetadataService(MetadataSource::new(provider)));
        }
        if let Some(level) = env_var("LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(json) = env_parse("JSON_LOGS")? {
            self.observability.json_logs = json;
        }
        if let Some(enabled) = env_parse("ENABLE_METRICS")? {
            self.observability.enable_metrics = enabled;
        }
        if let Some(port) = env_parse("METRICS_PORT")? {
            self.observability.metrics_port = port;
        }
        Ok(())
    }

    /// Configuration for tests: in-memory backend, fast retries.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            backend: BackendConfig { kind: BackendKind::Memory, ..Default::default() },
            kms: KmsConfig { key_name: Some("test-key".to_string()) },
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 10,
                max_backoff_ms: 40,
                ..Default::default()
            },
            observability: ObservabilityConfig { enable_metrics: false, ..Default::default() },
            ..Default::default()
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).ok().filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    env_var(name)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| {
                VaultkeeperError::config(format!("Invalid {}{}='{}': {}", ENV_PREFIX, name, raw, e))
            })
        })
        .transpose()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Gcp,
    #[default]
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gcp => write!(f, "gcp"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gcp" => Ok(Self::Gcp),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Secret store, KMS and object storage backend
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,

    pub project_id: String,

    /// REST base URLs; overridable for emulators
    pub endpoints: GcpEndpoints,

    #[validate(range(min = 1, max = 300, message = "Timeout must be between 1 and 300 seconds"))]
    pub request_timeout_seconds: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            project_id: String::new(),
            endpoints: GcpEndpoints::default(),
            request_timeout_seconds: 30,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpEndpoints {
    pub secret_manager: String,
    pub kms: String,
    pub storage: String,
}

impl Default for GcpEndpoints {
    fn default() -> Self {
        Self {
            secret_manager: "https://secretmanager.googleapis.com".to_string(),
            kms: "https://cloudkms.googleapis.com".to_string(),
            storage: "https://storage.googleapis.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    /// Full resource name of the key used to wrap data keys
    pub key_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BackupConfig {
    #[validate(length(min = 1, message = "Backup bucket cannot be empty"))]
    pub bucket: String,

    /// Object key prefix; keys are `{prefix}/{secret}/{timestamp}.json`
    #[validate(length(min = 1, message = "Backup prefix cannot be empty"))]
    pub prefix: String,

    /// Envelope-encrypt backup documents before upload
    pub encrypt: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            bucket: "vaultkeeper-backups".to_string(),
            prefix: "secrets".to_string(),
            encrypt: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    #[validate(range(max = 20, message = "At most 20 retries are allowed"))]
    pub max_retries: u32,

    #[validate(range(min = 1, message = "Initial backoff must be positive"))]
    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    #[validate(range(min = 1.0, max = 10.0, message = "Multiplier must be between 1 and 10"))]
    pub multiplier: f64,

    #[validate(range(min = 0.0, max = 1.0, message = "Jitter must be between 0 and 1"))]
    pub jitter: f64,

    /// Budget for all attempts together; 0 disables it
    pub overall_timeout_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 32_000,
            multiplier: 2.0,
            jitter: 0.1,
            overall_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RateLimitConfig {
    #[validate(range(min = 1, message = "Bucket capacity must be at least 1"))]
    pub max_tokens: u32,

    #[validate(range(min = 0.0, message = "Refill rate cannot be negative"))]
    pub refill_per_second: f64,

    /// Longest single wait for a token
    pub max_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_tokens: 100, refill_per_second: 10.0, max_wait_ms: 30_000 }
    }
}

/// Access control and auditing of payload reads.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AccessConfig {
    pub enabled: bool,

    /// Principal used when a call carries none, e.g. the daemon's own jobs
    #[validate(length(min = 1, message = "Service principal cannot be empty"))]
    pub service_principal: String,

    #[validate(range(min = 1, message = "At least one access per window must be allowed"))]
    pub max_requests_per_window: u32,

    #[validate(range(min = 1, message = "Rate limit window must be positive"))]
    pub window_seconds: u64,

    /// Audit entries kept in memory; older entries are dropped
    #[validate(range(min = 1, max = 1_000_000))]
    pub audit_capacity: usize,

    /// Policies keyed by secret name; secrets without one are unrestricted
    pub policies: BTreeMap<String, AccessPolicy>,
}

impl AccessConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_principal: "vaultkeeper".to_string(),
            max_requests_per_window: 100,
            window_seconds: 3600,
            audit_capacity: 1024,
            policies: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    #[validate(range(min = 1, message = "Secret TTL must be positive"))]
    pub secret_ttl_seconds: u64,

    #[validate(range(min = 1, message = "Listing TTL must be positive"))]
    pub listing_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true, secret_ttl_seconds: 300, listing_ttl_seconds: 120 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CredentialsConfig {
    pub source: Option<CredentialSource>,

    /// Tokens expiring within this many seconds are refreshed
    #[validate(range(max = 600, message = "Grace must be at most 600 seconds"))]
    pub expiry_grace_seconds: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self { source: None, expiry_grace_seconds: 30 }
    }
}

/// What TESTING does for secrets without a recognised type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTypePolicy {
    /// Log a warning and treat the test as passed
    #[default]
    WarnAndPass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RotationConfig {
    pub unknown_type_policy: UnknownTypePolicy,

    /// The new version must have been created within this window
    #[validate(range(min = 1, message = "Verification window must be positive"))]
    pub verification_window_seconds: u64,

    #[validate(range(min = 16, max = 4096, message = "Generated length must be 16..=4096"))]
    pub generated_length: usize,

    #[validate(range(min = 1, max = 300, message = "Probe timeout must be 1..=300 seconds"))]
    pub probe_timeout_seconds: u64,

    #[validate(range(min = 1, message = "Rollback timeout must be positive"))]
    pub rollback_timeout_seconds: u64,

    /// Scheduler tick; 0 disables scheduled rotation
    pub schedule_interval_seconds: u64,

    /// Rotations of different secrets the scheduler runs at once
    #[validate(range(min = 1, max = 64, message = "Concurrent rotations must be 1..=64"))]
    pub max_concurrent_rotations: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            unknown_type_policy: UnknownTypePolicy::WarnAndPass,
            verification_window_seconds: 300,
            generated_length: 32,
            probe_timeout_seconds: 30,
            rollback_timeout_seconds: 60,
            schedule_interval_seconds: 3_600,
            max_concurrent_rotations: 4,
        }
    }
}

impl RotationConfig {
    pub fn verification_window(&self) -> Duration {
        Duration::from_secs(self.verification_window_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_secs(self.rollback_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ComplianceConfig {
    pub required_labels: Vec<String>,

    /// Backups less frequent than this are flagged
    #[validate(range(min = 1, message = "Max backup interval must be positive"))]
    pub max_backup_interval_hours: u64,

    /// Periodic audit tick; 0 disables the auditor
    pub audit_interval_seconds: u64,

    /// Secret Manager list filter applied by the auditor
    pub secret_filter: Option<String>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            required_labels: vec!["owner".to_string(), "environment".to_string()],
            max_backup_interval_hours: 24,
            audit_interval_seconds: 86_400,
            secret_filter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    pub json_logs: bool,

    pub enable_metrics: bool,

    /// Prometheus listener port; 0 disables the listener
    pub metrics_port: u16,

    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            enable_metrics: true,
            metrics_port: 9090,
            service_name: "vaultkeeper".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}
