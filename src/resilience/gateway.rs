//! Uniform resilience for backend calls.
//!
//! [`BackendGateway`] runs every attempt through the rate limiter and records
//! its outcome; the retry executor decides whether another attempt follows.
//! The `Resilient*` decorators implement the backend traits on top of it so
//! callers never talk to a raw backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::Instrument;

use super::{CallContext, RateLimiter, RetryExecutor, RetryPolicy};
use crate::config::AppConfig;
use crate::domain::{Secret, SecretVersion, VersionSelector};
use crate::errors::Result;
use crate::observability::MetricsRecorder;
use crate::secrets::backends::{
    KmsClient, KmsDecryptResponse, KmsEncryptResponse, ObjectStore, SecretStore,
};
use crate::secrets::checksum::verify_reported;

#[derive(Debug, Clone)]
pub struct BackendGateway {
    limiter: RateLimiter,
    retry: RetryExecutor,
    metrics: MetricsRecorder,
}

impl BackendGateway {
    pub fn new(limiter: RateLimiter, retry: RetryExecutor, metrics: MetricsRecorder) -> Self {
        Self { limiter, retry, metrics }
    }

    pub fn from_config(config: &AppConfig, metrics: MetricsRecorder) -> Self {
        Self::new(
            RateLimiter::from_config(&config.rate_limit, metrics.clone()),
            RetryExecutor::new(RetryPolicy::from_config(&config.retry), metrics.clone()),
            metrics,
        )
    }

    /// No rate limit and no retries.
    pub fn passthrough() -> Self {
        let metrics = MetricsRecorder::new();
        Self::new(
            RateLimiter::unlimited(),
            RetryExecutor::new(RetryPolicy::none(), metrics.clone()),
            metrics,
        )
    }

    pub async fn call<T, F, Fut>(
        &self,
        ctx: &CallContext,
        operation: &str,
        resource: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.retry.execute(ctx, operation, || {
            let attempt = op();
            async move {
                self.limiter.acquire(ctx).await?;
                let started = Instant::now();
                let result = attempt.await;
                let outcome = match &result {
                    Ok(_) => "success",
                    Err(e) => e.category().as_str(),
                };
                self.metrics.record_backend_call(
                    operation,
                    outcome,
                    started.elapsed().as_secs_f64(),
                );
                result
            }
        });
        attempts.instrument(crate::backend_span!(operation, resource)).await
    }
}

/// [`SecretStore`] with rate limiting, retries and payload checksum verification.
#[derive(Debug, Clone)]
pub struct ResilientSecretStore {
    inner: Arc<dyn SecretStore>,
    gateway: BackendGateway,
}

impl ResilientSecretStore {
    pub fn new(inner: Arc<dyn SecretStore>, gateway: BackendGateway) -> Self {
        Self { inner, gateway }
    }
}

#[async_trait]
impl SecretStore for ResilientSecretStore {
    async fn get_secret(&self, ctx: &CallContext, name: &str) -> Result<Secret> {
        self.gateway.call(ctx, "get_secret", name, || self.inner.get_secret(ctx, name)).await
    }

    async fn list_secrets(&self, ctx: &CallContext) -> Result<Vec<Secret>> {
        self.gateway.call(ctx, "list_secrets", "*", || self.inner.list_secrets(ctx)).await
    }

    async fn access_version(
        &self,
        ctx: &CallContext,
        name: &str,
        selector: &VersionSelector,
    ) -> Result<SecretVersion> {
        let version = self
            .gateway
            .call(ctx, "access_version", name, || self.inner.access_version(ctx, name, selector))
            .await?;
        verify_reported(
            "access_version",
            &version.id,
            &version.payload_ciphertext,
            Some(version.checksum),
        )?;
        Ok(version)
    }

    async fn add_version(
        &self,
        ctx: &CallContext,
        name: &str,
        payload: &[u8],
    ) -> Result<SecretVersion> {
        self.gateway
            .call(ctx, "add_version", name, || self.inner.add_version(ctx, name, payload))
            .await
    }

    async fn disable_version(&self, ctx: &CallContext, version_id: &str) -> Result<()> {
        self.gateway
            .call(ctx, "disable_version", version_id, || {
                self.inner.disable_version(ctx, version_id)
            })
            .await
    }

    async fn enable_version(&self, ctx: &CallContext, version_id: &str) -> Result<()> {
        self.gateway
            .call(ctx, "enable_version", version_id, || self.inner.enable_version(ctx, version_id))
            .await
    }

    async fn list_versions(&self, ctx: &CallContext, name: &str) -> Result<Vec<SecretVersion>> {
        self.gateway.call(ctx, "list_versions", name, || self.inner.list_versions(ctx, name)).await
    }

    async fn record_rotation(
        &self,
        ctx: &CallContext,
        name: &str,
        rotated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.gateway
            .call(ctx, "record_rotation", name, || {
                self.inner.record_rotation(ctx, name, rotated_at)
            })
            .await
    }
}

/// [`KmsClient`] with rate limiting and retries. Checksums are left to the cipher.
#[derive(Debug, Clone)]
pub struct ResilientKms {
    inner: Arc<dyn KmsClient>,
    gateway: BackendGateway,
}

impl ResilientKms {
    pub fn new(inner: Arc<dyn KmsClient>, gateway: BackendGateway) -> Self {
        Self { inner, gateway }
    }
}

#[async_trait]
impl KmsClient for ResilientKms {
    async fn encrypt(
        &self,
        ctx: &CallContext,
        key_name: &str,
        plaintext: &[u8],
        plaintext_crc32c: u32,
    ) -> Result<KmsEncryptResponse> {
        self.gateway
            .call(ctx, "kms_encrypt", key_name, || {
                self.inner.encrypt(ctx, key_name, plaintext, plaintext_crc32c)
            })
            .await
    }

    async fn decrypt(
        &self,
        ctx: &CallContext,
        key_name: &str,
        ciphertext: &[u8],
        ciphertext_crc32c: u32,
    ) -> Result<KmsDecryptResponse> {
        self.gateway
            .call(ctx, "kms_decrypt", key_name, || {
                self.inner.decrypt(ctx, key_name, ciphertext, ciphertext_crc32c)
            })
            .await
    }
}

/// [`ObjectStore`] with rate limiting and retries.
#[derive(Debug, Clone)]
pub struct ResilientObjectStore {
    inner: Arc<dyn ObjectStore>,
    gateway: BackendGateway,
}

impl ResilientObjectStore {
    pub fn new(inner: Arc<dyn ObjectStore>, gateway: BackendGateway) -> Self {
        Self { inner, gateway }
    }
}

#[async_trait]
impl ObjectStore for ResilientObjectStore {
    async fn put_object(
        &self,
        ctx: &CallContext,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.gateway
            .call(ctx, "put_object", key, || self.inner.put_object(ctx, bucket, key, bytes.clone()))
            .await
    }

    async fn get_object(&self, ctx: &CallContext, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.gateway.call(ctx, "get_object", key, || self.inner.get_object(ctx, bucket, key)).await
    }
}
