//! In-memory backends for local development and tests.
//!
//! These mirror the observable behavior of the hosted services closely enough
//! to drive the rotation state machine end to end: version numbering, the
//! `latest` alias, version states, KMS checksum reporting. Each one can be
//! told to fail specific operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{KmsClient, KmsDecryptResponse, KmsEncryptResponse, ObjectStore, SecretStore};
use crate::domain::{annotations, Secret, SecretVersion, VersionSelector, VersionState};
use crate::errors::{Result, VaultkeeperError};
use crate::resilience::CallContext;
use crate::secrets::checksum::crc32c;
use crate::secrets::SecretBytes;

const NONCE_SIZE: usize = 12;

/// Queue of errors to return from the next calls of named operations.
#[derive(Debug, Default)]
struct FaultInjector {
    queued: Mutex<HashMap<String, VecDeque<VaultkeeperError>>>,
    calls: AtomicU64,
}

impl FaultInjector {
    fn push(&self, operation: &str, error: VaultkeeperError) {
        if let Ok(mut queued) = self.queued.lock() {
            queued.entry(operation.to_string()).or_default().push_back(error);
        }
    }

    /// Count the call and pop an injected failure for `operation`, if any.
    fn enter(&self, ctx: &CallContext, operation: &str) -> Result<()> {
        ctx.check(operation)?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected =
            self.queued.lock().ok().and_then(|mut q| q.get_mut(operation)?.pop_front());
        match injected {
            Some(error) => {
                debug!(operation = %operation, "Returning injected failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct StoredSecret {
    secret: Secret,
    versions: Vec<SecretVersion>,
}

/// Secret store kept in process memory.
#[derive(Debug)]
pub struct MemorySecretStore {
    project: String,
    secrets: RwLock<HashMap<String, StoredSecret>>,
    faults: FaultInjector,
}

impl MemorySecretStore {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            secrets: RwLock::new(HashMap::new()),
            faults: FaultInjector::default(),
        }
    }

    pub fn resource_path(&self, name: &str) -> String {
        format!("projects/{}/secrets/{}", self.project, name)
    }

    /// Register a secret. Its `resource_path` is rewritten to this store's project.
    pub async fn insert_secret(&self, mut secret: Secret) {
        secret.resource_path = self.resource_path(&secret.name);
        let mut secrets = self.secrets.write().await;
        let entry = secrets
            .entry(secret.name.clone())
            .or_insert_with(|| StoredSecret { secret: secret.clone(), versions: Vec::new() });
        entry.secret = secret;
    }

    /// Queue a failure for the next call of `operation` (e.g. `"add_version"`).
    pub fn fail_next(&self, operation: &str, error: VaultkeeperError) {
        self.faults.push(operation, error);
    }

    /// Total number of trait calls received.
    pub fn call_count(&self) -> u64 {
        self.faults.calls()
    }

    /// Overwrite a stored payload without updating its checksum.
    pub async fn corrupt_version(&self, version_id: &str) -> bool {
        let mut secrets = self.secrets.write().await;
        for stored in secrets.values_mut() {
            if let Some(v) = stored.versions.iter_mut().find(|v| v.id == version_id) {
                match v.payload_ciphertext.first_mut() {
                    Some(byte) => *byte ^= 0xFF,
                    None => v.payload_ciphertext.push(0xFF),
                }
                return true;
            }
        }
        false
    }

    /// Versions with payloads, oldest first, bypassing the trait.
    pub async fn snapshot_versions(&self, name: &str) -> Vec<SecretVersion> {
        self.secrets.read().await.get(name).map(|s| s.versions.clone()).unwrap_or_default()
    }

    fn split_version_id(version_id: &str) -> Option<(&str, u64)> {
        let (secret_path, number) = version_id.rsplit_once("/versions/")?;
        let name = secret_path.rsplit('/').next()?;
        Some((name, number.parse().ok()?))
    }

    async fn set_state(&self, version_id: &str, state: VersionState) -> Result<()> {
        let (name, number) = Self::split_version_id(version_id).ok_or_else(|| {
            VaultkeeperError::validation_field("Malformed version id", "version_id")
        })?;
        let mut secrets = self.secrets.write().await;
        let version = secrets
            .get_mut(name)
            .and_then(|s| s.versions.iter_mut().find(|v| v.number() == Some(number)))
            .ok_or_else(|| VaultkeeperError::not_found("secret_version", version_id))?;
        if version.state == VersionState::Destroyed {
            return Err(VaultkeeperError::backend(
                "set_version_state",
                version_id,
                "version is destroyed",
                false,
            ));
        }
        version.state = state;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, ctx: &CallContext, name: &str) -> Result<Secret> {
        self.faults.enter(ctx, "get_secret")?;
        self.secrets
            .read()
            .await
            .get(name)
            .map(|s| s.secret.clone())
            .ok_or_else(|| VaultkeeperError::not_found("secret", self.resource_path(name)))
    }

    async fn list_secrets(&self, ctx: &CallContext) -> Result<Vec<Secret>> {
        self.faults.enter(ctx, "list_secrets")?;
        let mut secrets: Vec<Secret> =
            self.secrets.read().await.values().map(|s| s.secret.clone()).collect();
        secrets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(secrets)
    }

    async fn access_version(
        &self,
        ctx: &CallContext,
        name: &str,
        selector: &VersionSelector,
    ) -> Result<SecretVersion> {
        self.faults.enter(ctx, "access_version")?;
        let secrets = self.secrets.read().await;
        let stored = secrets
            .get(name)
            .ok_or_else(|| VaultkeeperError::not_found("secret", self.resource_path(name)))?;

        let version = match selector {
            VersionSelector::Latest => stored.versions.last(),
            VersionSelector::Id(_) => {
                let wanted = selector.as_path_segment().parse::<u64>().ok();
                stored.versions.iter().find(|v| v.number() == wanted)
            }
        }
        .ok_or_else(|| {
            VaultkeeperError::not_found(
                "secret_version",
                format!("{}/versions/{}", stored.secret.resource_path, selector),
            )
        })?;

        if version.state != VersionState::Enabled {
            return Err(VaultkeeperError::backend(
                "access_version",
                &version.id,
                format!("version is {}", version.state),
                false,
            ));
        }
        Ok(version.clone())
    }

    async fn add_version(
        &self,
        ctx: &CallContext,
        name: &str,
        payload: &[u8],
    ) -> Result<SecretVersion> {
        self.faults.enter(ctx, "add_version")?;
        let mut secrets = self.secrets.write().await;
        let stored = secrets
            .get_mut(name)
            .ok_or_else(|| VaultkeeperError::not_found("secret", self.resource_path(name)))?;

        let number = stored.versions.last().and_then(|v| v.number()).unwrap_or(0) + 1;
        let version = SecretVersion {
            id: format!("{}/versions/{}", stored.secret.resource_path, number),
            secret_name: name.to_string(),
            payload_ciphertext: payload.to_vec(),
            checksum: crc32c(payload),
            state: VersionState::Enabled,
            created_at: Utc::now(),
        };
        stored.versions.push(version.clone());
        debug!(secret = %name, version = number, "Added secret version");
        Ok(version)
    }

    async fn disable_version(&self, ctx: &CallContext, version_id: &str) -> Result<()> {
        self.faults.enter(ctx, "disable_version")?;
        self.set_state(version_id, VersionState::Disabled).await
    }

    async fn enable_version(&self, ctx: &CallContext, version_id: &str) -> Result<()> {
        self.faults.enter(ctx, "enable_version")?;
        self.set_state(version_id, VersionState::Enabled).await
    }

    async fn list_versions(&self, ctx: &CallContext, name: &str) -> Result<Vec<SecretVersion>> {
        self.faults.enter(ctx, "list_versions")?;
        let secrets = self.secrets.read().await;
        let stored = secrets
            .get(name)
            .ok_or_else(|| VaultkeeperError::not_found("secret", self.resource_path(name)))?;
        Ok(stored
            .versions
            .iter()
            .rev()
            .map(|v| SecretVersion { payload_ciphertext: Vec::new(), checksum: 0, ..v.clone() })
            .collect())
    }

    async fn record_rotation(
        &self,
        ctx: &CallContext,
        name: &str,
        rotated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.faults.enter(ctx, "record_rotation")?;
        let mut secrets = self.secrets.write().await;
        let stored = secrets
            .get_mut(name)
            .ok_or_else(|| VaultkeeperError::not_found("secret", self.resource_path(name)))?;
        if let Some(policy) = stored.secret.rotation_policy.as_mut() {
            policy.last_rotated_at = Some(rotated_at);
        }
        stored
            .secret
            .annotations
            .insert(annotations::LAST_ROTATED_AT.to_string(), rotated_at.to_rfc3339());
        Ok(())
    }
}

/// How the in-memory KMS reports checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumMode {
    #[default]
    Honest,
    /// Omit checksums from responses
    Missing,
    /// Report checksums that do not match the returned data
    Wrong,
}

/// KMS that wraps data keys with AES-256-GCM under per-key-name random keys.
#[derive(Debug)]
pub struct MemoryKms {
    keys: Mutex<HashMap<String, Arc<[u8; 32]>>>,
    checksum_mode: Mutex<ChecksumMode>,
    rng: SystemRandom,
    faults: FaultInjector,
}

impl Default for MemoryKms {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKms {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            checksum_mode: Mutex::new(ChecksumMode::Honest),
            rng: SystemRandom::new(),
            faults: FaultInjector::default(),
        }
    }

    pub fn set_checksum_mode(&self, mode: ChecksumMode) {
        if let Ok(mut current) = self.checksum_mode.lock() {
            *current = mode;
        }
    }

    pub fn fail_next(&self, operation: &str, error: VaultkeeperError) {
        self.faults.push(operation, error);
    }

    pub fn call_count(&self) -> u64 {
        self.faults.calls()
    }

    fn mode(&self) -> ChecksumMode {
        self.checksum_mode.lock().map(|m| *m).unwrap_or_default()
    }

    fn key(&self, key_name: &str) -> Result<LessSafeKey> {
        let mut keys =
            self.keys.lock().map_err(|_| VaultkeeperError::internal("KMS key table poisoned"))?;
        let bytes = match keys.get(key_name) {
            Some(bytes) => Arc::clone(bytes),
            None => {
                let mut fresh = [0u8; 32];
                self.rng
                    .fill(&mut fresh)
                    .map_err(|_| VaultkeeperError::internal("Failed to generate KMS key"))?;
                let fresh = Arc::new(fresh);
                keys.insert(key_name.to_string(), Arc::clone(&fresh));
                fresh
            }
        };
        let unbound = UnboundKey::new(&AES_256_GCM, &*bytes)
            .map_err(|_| VaultkeeperError::internal("Failed to create KMS key"))?;
        Ok(LessSafeKey::new(unbound))
    }

    fn report(&self, data: &[u8]) -> Option<u32> {
        match self.mode() {
            ChecksumMode::Honest => Some(crc32c(data)),
            ChecksumMode::Missing => None,
            ChecksumMode::Wrong => Some(crc32c(data) ^ 0xDEAD_BEEF),
        }
    }
}

#[async_trait]
impl KmsClient for MemoryKms {
    async fn encrypt(
        &self,
        ctx: &CallContext,
        key_name: &str,
        plaintext: &[u8],
        plaintext_crc32c: u32,
    ) -> Result<KmsEncryptResponse> {
        self.faults.enter(ctx, "kms_encrypt")?;
        if crc32c(plaintext) != plaintext_crc32c {
            return Err(VaultkeeperError::integrity(
                "kms_encrypt",
                key_name,
                Some(plaintext_crc32c),
                Some(crc32c(plaintext)),
            ));
        }

        let key = self.key(key_name)?;
        let mut nonce = [0u8; NONCE_SIZE];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| VaultkeeperError::internal("Failed to generate nonce"))?;
        let mut sealed = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(key_name.as_bytes()),
            &mut sealed,
        )
        .map_err(|_| VaultkeeperError::internal("KMS encryption failed"))?;

        let mut ciphertext = nonce.to_vec();
        ciphertext.extend_from_slice(&sealed);
        let ciphertext_crc32c = self.report(&ciphertext);
        Ok(KmsEncryptResponse {
            ciphertext,
            ciphertext_crc32c,
            verified_plaintext_crc32c: self.mode() != ChecksumMode::Missing,
        })
    }

    async fn decrypt(
        &self,
        ctx: &CallContext,
        key_name: &str,
        ciphertext: &[u8],
        ciphertext_crc32c: u32,
    ) -> Result<KmsDecryptResponse> {
        self.faults.enter(ctx, "kms_decrypt")?;
        if crc32c(ciphertext) != ciphertext_crc32c {
            return Err(VaultkeeperError::integrity(
                "kms_decrypt",
                key_name,
                Some(ciphertext_crc32c),
                Some(crc32c(ciphertext)),
            ));
        }
        if ciphertext.len() < NONCE_SIZE + aead::AES_256_GCM.tag_len() {
            return Err(VaultkeeperError::backend(
                "kms_decrypt",
                key_name,
                "ciphertext too short",
                false,
            ));
        }

        let key = self.key(key_name)?;
        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| VaultkeeperError::internal("Invalid nonce"))?;
        let mut buffer = sealed.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::from(key_name.as_bytes()), &mut buffer)
            .map_err(|_| {
                VaultkeeperError::backend("kms_decrypt", key_name, "decryption failed", false)
            })?
            .to_vec();

        let plaintext_crc32c = self.report(&plaintext);
        Ok(KmsDecryptResponse { plaintext: SecretBytes::new(plaintext), plaintext_crc32c })
    }
}

/// Bucket/key addressed blob store.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
    faults: FaultInjector,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, operation: &str, error: VaultkeeperError) {
        self.faults.push(operation, error);
    }

    /// Object keys stored in `bucket`, sorted.
    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        ctx: &CallContext,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.faults.enter(ctx, "put_object")?;
        self.objects.write().await.insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    async fn get_object(&self, ctx: &CallContext, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.faults.enter(ctx, "get_object")?;
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| {
                VaultkeeperError::not_found("object", format!("gs://{}/{}", bucket, key))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versions_append_and_latest() {
        let store = MemorySecretStore::new("proj");
        let ctx = CallContext::new();
        store.insert_secret(Secret::new("api-key", "")).await;

        let v1 = store.add_version(&ctx, "api-key", b"one").await.unwrap();
        let v2 = store.add_version(&ctx, "api-key", b"two").await.unwrap();
        assert_eq!(v1.id, "projects/proj/secrets/api-key/versions/1");
        assert_eq!(v2.number(), Some(2));

        let latest = store.access_version(&ctx, "api-key", &VersionSelector::Latest).await.unwrap();
        assert_eq!(latest.payload_ciphertext, b"two");
        assert_eq!(latest.checksum, crc32c(b"two"));

        let listed = store.list_versions(&ctx, "api-key").await.unwrap();
        assert_eq!(listed[0].id, v2.id);
        assert!(listed[0].payload_ciphertext.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_version_not_accessible() {
        let store = MemorySecretStore::new("proj");
        let ctx = CallContext::new();
        store.insert_secret(Secret::new("s", "")).await;
        let v1 = store.add_version(&ctx, "s", b"x").await.unwrap();

        store.disable_version(&ctx, &v1.id).await.unwrap();
        let err = store
            .access_version(&ctx, "s", &VersionSelector::Id(v1.id.clone()))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());

        store.enable_version(&ctx, &v1.id).await.unwrap();
        assert!(store.access_version(&ctx, "s", &VersionSelector::Latest).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let store = MemorySecretStore::new("proj");
        let ctx = CallContext::new();
        store.insert_secret(Secret::new("s", "")).await;
        store.fail_next("add_version", VaultkeeperError::transient("add_version", "s", "503"));

        assert!(store.add_version(&ctx, "s", b"x").await.is_err());
        assert!(store.add_version(&ctx, "s", b"x").await.is_ok());
        assert_eq!(store.call_count(), 2);
    }

    #[tokio::test]
    async fn test_kms_roundtrip_reports_checksums() {
        let kms = MemoryKms::new();
        let ctx = CallContext::new();
        let dek = [7u8; 32];

        let wrapped = kms.encrypt(&ctx, "key-a", &dek, crc32c(&dek)).await.unwrap();
        assert!(wrapped.verified_plaintext_crc32c);
        assert_eq!(wrapped.ciphertext_crc32c, Some(crc32c(&wrapped.ciphertext)));

        let unwrapped = kms
            .decrypt(&ctx, "key-a", &wrapped.ciphertext, crc32c(&wrapped.ciphertext))
            .await
            .unwrap();
        assert_eq!(unwrapped.plaintext.expose_secret(), &dek);

        let wrong_key = kms
            .decrypt(&ctx, "key-b", &wrapped.ciphertext, crc32c(&wrapped.ciphertext))
            .await;
        assert!(wrong_key.is_err());
    }

    #[tokio::test]
    async fn test_kms_missing_checksum_mode() {
        let kms = MemoryKms::new();
        kms.set_checksum_mode(ChecksumMode::Missing);
        let resp = kms.encrypt(&CallContext::new(), "k", b"abc", crc32c(b"abc")).await.unwrap();
        assert_eq!(resp.ciphertext_crc32c, None);
        assert!(!resp.verified_plaintext_crc32c);
    }

    #[tokio::test]
    async fn test_object_store_roundtrip() {
        let objects = MemoryObjectStore::new();
        let ctx = CallContext::new();
        objects.put_object(&ctx, "bucket", "secrets/a/1.json", b"{}".to_vec()).await.unwrap();
        assert_eq!(objects.get_object(&ctx, "bucket", "secrets/a/1.json").await.unwrap(), b"{}");
        assert_eq!(objects.keys("bucket").await, vec!["secrets/a/1.json".to_string()]);
        assert!(objects.get_object(&ctx, "bucket", "missing").await.is_err());
    }
}
