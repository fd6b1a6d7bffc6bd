//! Pre-rotation snapshots in object storage
//!
//! A backup is a JSON document holding the latest version's stored bytes
//! (base64) plus enough metadata to verify them on the way back. When
//! `backup.encrypt` is set the document is sealed with the [`SecretCipher`]
//! before upload. Restoring never rewrites history: the archived bytes are
//! appended as a new version and the failed version is disabled.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::secret_cipher::SecretCipher;
use crate::config::BackupConfig;
use crate::domain::{BackupId, BackupRecord, SecretVersion, VersionSelector};
use crate::errors::{Result, VaultkeeperError};
use crate::resilience::CallContext;
use crate::secrets::checksum::crc32c;
use crate::secrets::{ObjectStore, SecretStore};

/// Metadata stored next to the archived payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub version_id: String,
    /// CRC32C of the decoded payload
    pub checksum: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// The archived document, as written to object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDocument {
    pub name: String,
    /// Base64 of the version's stored bytes
    pub payload: String,
    pub metadata: BackupMetadata,
    pub timestamp: DateTime<Utc>,
}

impl BackupDocument {
    /// Decode the payload and check it against the recorded checksum.
    pub fn decode_payload(&self) -> Result<Vec<u8>> {
        let payload = BASE64.decode(&self.payload).map_err(|e| {
            VaultkeeperError::corrupted("restore", format!("backup payload is not base64: {}", e))
        })?;
        let computed = crc32c(&payload);
        if computed != self.metadata.checksum {
            return Err(VaultkeeperError::integrity(
                "restore",
                &self.name,
                Some(self.metadata.checksum),
                Some(computed),
            ));
        }
        Ok(payload)
    }
}

/// Object key for a backup taken at `at`.
pub fn object_key(prefix: &str, secret_name: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}.json",
        prefix.trim_end_matches('/'),
        secret_name,
        at.format("%Y%m%dT%H%M%S%.3fZ")
    )
}

#[derive(Debug, Clone)]
pub struct BackupArchiver {
    store: Arc<dyn SecretStore>,
    objects: Arc<dyn ObjectStore>,
    cipher: SecretCipher,
    config: BackupConfig,
}

impl BackupArchiver {
    pub fn new(
        store: Arc<dyn SecretStore>,
        objects: Arc<dyn ObjectStore>,
        cipher: SecretCipher,
        config: BackupConfig,
    ) -> Self {
        Self { store, objects, cipher, config }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Archive the current latest version of `secret_name`.
    ///
    /// Any failure here must abort the caller before it mutates the secret.
    #[instrument(skip(self, ctx), fields(bucket = %self.config.bucket))]
    pub async fn backup(&self, ctx: &CallContext, secret_name: &str) -> Result<BackupRecord> {
        if self.config.encrypt && !self.cipher.is_configured() {
            return Err(VaultkeeperError::encryption_unavailable("backup"));
        }

        let ctx = ctx.fresh();
        let secret = self.store.get_secret(&ctx, secret_name).await?;
        let version = self.store.access_version(&ctx, secret_name, &VersionSelector::Latest).await?;

        let now = Utc::now();
        let document = BackupDocument {
            name: secret_name.to_string(),
            payload: BASE64.encode(&version.payload_ciphertext),
            metadata: BackupMetadata {
                version_id: version.id.clone(),
                checksum: crc32c(&version.payload_ciphertext),
                created_at: version.created_at,
                labels: secret.labels,
            },
            timestamp: now,
        };
        let mut bytes = serde_json::to_vec(&document).map_err(|e| {
            VaultkeeperError::Serialization { source: e, context: "backup document".to_string() }
        })?;
        if self.config.encrypt {
            bytes = self.cipher.encrypt(&ctx, &bytes).await?;
        }

        let key = object_key(&self.config.prefix, secret_name, now);
        self.objects.put_object(&ctx, &self.config.bucket, &key, bytes).await?;

        let record = BackupRecord {
            id: BackupId::new(),
            secret_name: secret_name.to_string(),
            version_id: version.id,
            bucket: self.config.bucket.clone(),
            object_key: key,
            created_at: now,
            encrypted: self.config.encrypt,
        };
        info!(
            secret = %secret_name,
            backup_id = %record.id,
            version = %record.version_id,
            object_key = %record.object_key,
            "Secret backed up"
        );
        Ok(record)
    }

    /// Fetch and open the document a record points at.
    pub async fn load(&self, ctx: &CallContext, record: &BackupRecord) -> Result<BackupDocument> {
        let mut bytes = self.objects.get_object(ctx, &record.bucket, &record.object_key).await?;
        if record.encrypted {
            bytes = self.cipher.decrypt(ctx, &bytes).await?.expose_secret().to_vec();
        }
        let document: BackupDocument = serde_json::from_slice(&bytes).map_err(|e| {
            VaultkeeperError::Serialization { source: e, context: "backup document".to_string() }
        })?;
        if document.name != record.secret_name {
            return Err(VaultkeeperError::corrupted(
                "restore",
                format!(
                    "backup '{}' belongs to '{}', not '{}'",
                    record.object_key, document.name, record.secret_name
                ),
            ));
        }
        Ok(document)
    }

    /// Re-add the archived payload as a new version and disable `failed_version`.
    #[instrument(
        skip(self, ctx, record),
        fields(secret = %record.secret_name, backup_id = %record.id)
    )]
    pub async fn restore(
        &self,
        ctx: &CallContext,
        record: &BackupRecord,
        failed_version: Option<&str>,
    ) -> Result<SecretVersion> {
        let document = self.load(ctx, record).await?;
        let payload = document.decode_payload()?;

        let restored = self.store.add_version(ctx, &record.secret_name, &payload).await?;
        if let Some(failed) = failed_version {
            if failed == record.version_id {
                warn!(
                    version = %failed,
                    "Failed version is the backed-up version; leaving it enabled"
                );
            } else {
                self.store.disable_version(ctx, failed).await?;
            }
        }

        info!(
            restored_version = %restored.id,
            from_version = %document.metadata.version_id,
            "Secret restored from backup"
        );
        Ok(restored)
    }
}
