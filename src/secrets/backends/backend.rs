//! Backend boundary traits
//!
//! Three external systems sit behind these traits: the secret store, the KMS
//! and object storage. Every method takes a [`CallContext`] so callers can
//! cancel in-flight requests. Implementations report failures as
//! [`VaultkeeperError::Backend`](crate::errors::VaultkeeperError::Backend)
//! with the retryable flag set for transient conditions; retry, rate limiting
//! and caching are layered on top by the decorators in [`crate::resilience`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

use crate::domain::{Secret, SecretVersion, VersionSelector};
use crate::errors::Result;
use crate::resilience::CallContext;
use crate::secrets::SecretBytes;

/// Secret store: secret metadata plus an append-only list of versions.
#[async_trait]
pub trait SecretStore: Send + Sync + fmt::Debug {
    /// Fetch metadata and policies for a secret.
    async fn get_secret(&self, ctx: &CallContext, name: &str) -> Result<Secret>;

    /// List managed secrets (metadata only).
    async fn list_secrets(&self, ctx: &CallContext) -> Result<Vec<Secret>>;

    /// Read one version including its payload and reported checksum.
    async fn access_version(
        &self,
        ctx: &CallContext,
        name: &str,
        selector: &VersionSelector,
    ) -> Result<SecretVersion>;

    /// Append a new ENABLED version. It becomes the latest version.
    async fn add_version(&self, ctx: &CallContext, name: &str, payload: &[u8])
        -> Result<SecretVersion>;

    /// Move a version to DISABLED. `version_id` is the full resource path.
    async fn disable_version(&self, ctx: &CallContext, version_id: &str) -> Result<()>;

    /// Move a version back to ENABLED.
    async fn enable_version(&self, ctx: &CallContext, version_id: &str) -> Result<()>;

    /// All versions of a secret, newest first. Payloads are not included.
    async fn list_versions(&self, ctx: &CallContext, name: &str) -> Result<Vec<SecretVersion>>;

    /// Persist the time of the last committed rotation.
    async fn record_rotation(
        &self,
        ctx: &CallContext,
        name: &str,
        rotated_at: DateTime<Utc>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsEncryptResponse {
    pub ciphertext: Vec<u8>,
    /// CRC32C of `ciphertext` as computed by the KMS, if reported
    pub ciphertext_crc32c: Option<u32>,
    /// Whether the KMS confirmed the request's plaintext checksum
    pub verified_plaintext_crc32c: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsDecryptResponse {
    pub plaintext: SecretBytes,
    /// CRC32C of `plaintext` as computed by the KMS, if reported
    pub plaintext_crc32c: Option<u32>,
}

/// Key management service wrapping and unwrapping data keys.
#[async_trait]
pub trait KmsClient: Send + Sync + fmt::Debug {
    async fn encrypt(
        &self,
        ctx: &CallContext,
        key_name: &str,
        plaintext: &[u8],
        plaintext_crc32c: u32,
    ) -> Result<KmsEncryptResponse>;

    async fn decrypt(
        &self,
        ctx: &CallContext,
        key_name: &str,
        ciphertext: &[u8],
        ciphertext_crc32c: u32,
    ) -> Result<KmsDecryptResponse>;
}

/// Durable object storage, used only for backups.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    async fn put_object(&self, ctx: &CallContext, bucket: &str, key: &str, bytes: Vec<u8>)
        -> Result<()>;

    async fn get_object(&self, ctx: &CallContext, bucket: &str, key: &str) -> Result<Vec<u8>>;
}
