//! # Vaultkeeper
//!
//! Secret lifecycle management on top of a hosted secret store: envelope
//! encryption with KMS-wrapped data keys, rotation with backup and rollback,
//! compliance scanning, and resilient access to every backend.
//!
//! ## Architecture
//!
//! ```text
//! RotationCoordinator ─┬─ BackupArchiver ── ObjectStore
//! ComplianceAuditor ───┼─ SecretCipher ──── KmsClient
//!                      └─ SecretStore
//!                              │
//!   AccessGuard → CachedSecretStore → Resilient* (rate limit, retry, metrics) → backend
//!                                                                               │
//!                                                     CredentialResolver (bearer tokens)
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vaultkeeper::resilience::CallContext;
//! use vaultkeeper::secrets::MemoryKms;
//! use vaultkeeper::services::SecretCipher;
//!
//! # async fn run() -> vaultkeeper::Result<()> {
//! let cipher = SecretCipher::new(Arc::new(MemoryKms::new()), "local/keyRings/r/cryptoKeys/k");
//! let ctx = CallContext::new();
//! let envelope = cipher.encrypt(&ctx, b"s3cret").await?;
//! let plaintext = cipher.decrypt(&ctx, &envelope).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod domain;
pub mod errors;
pub mod observability;
pub mod resilience;
pub mod secrets;
pub mod services;

pub use config::AppConfig;
pub use errors::{Result, VaultkeeperError};
pub use observability::init_observability;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
