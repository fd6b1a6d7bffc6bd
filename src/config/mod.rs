//! # Configuration Management

pub mod settings;

pub use settings::{
    AccessConfig, AppConfig, BackendConfig, BackendKind, BackupConfig, CacheConfig, ComplianceConfig,
    CredentialsConfig, GcpEndpoints, KmsConfig, ObservabilityConfig, RateLimitConfig,
    RetryConfig, RotationConfig, UnknownTypePolicy, ENV_PREFIX,
};
