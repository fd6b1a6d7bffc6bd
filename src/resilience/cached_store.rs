//! Read-through caching for the secret store.
//!
//! Secret metadata, the secret listing and version listings are cached.
//! Payload reads (`access_version`) always go to the backend. Every mutating
//! call invalidates the entries it could have changed, and a context built
//! with [`CallContext::fresh`] skips the cache for reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{CallContext, ResponseCache};
use crate::config::CacheConfig;
use crate::domain::{Secret, SecretVersion, VersionSelector};
use crate::errors::Result;
use crate::observability::MetricsRecorder;
use crate::secrets::backends::SecretStore;

const LISTING_KEY: &str = "*";

#[derive(Debug, Clone)]
pub struct CachedSecretStore {
    inner: Arc<dyn SecretStore>,
    secrets: ResponseCache<Secret>,
    listing: ResponseCache<Vec<Secret>>,
    versions: ResponseCache<Vec<SecretVersion>>,
}

impl CachedSecretStore {
    pub fn new(
        inner: Arc<dyn SecretStore>,
        config: &CacheConfig,
        metrics: MetricsRecorder,
    ) -> Self {
        let secret_ttl = std::time::Duration::from_secs(config.secret_ttl_seconds);
        let listing_ttl = std::time::Duration::from_secs(config.listing_ttl_seconds);
        Self {
            inner,
            secrets: ResponseCache::new("secrets", secret_ttl, metrics.clone()),
            listing: ResponseCache::new("secret_listing", listing_ttl, metrics.clone()),
            versions: ResponseCache::new("versions", listing_ttl, metrics),
        }
    }

    /// Drop everything cached for `name`.
    pub async fn invalidate(&self, name: &str) {
        self.secrets.invalidate(name).await;
        self.versions.invalidate(name).await;
        self.listing.invalidate(LISTING_KEY).await;
    }

    fn secret_name_of(version_id: &str) -> Option<&str> {
        version_id.rsplit_once("/versions/")?.0.rsplit('/').next()
    }
}

#[async_trait]
impl SecretStore for CachedSecretStore {
    async fn get_secret(&self, ctx: &CallContext, name: &str) -> Result<Secret> {
        if !ctx.bypass_cache() {
            if let Some(secret) = self.secrets.get(name).await {
                return Ok(secret);
            }
        }
        let secret = self.inner.get_secret(ctx, name).await?;
        self.secrets.put_default(name, secret.clone()).await;
        Ok(secret)
    }

    async fn list_secrets(&self, ctx: &CallContext) -> Result<Vec<Secret>> {
        if !ctx.bypass_cache() {
            if let Some(secrets) = self.listing.get(LISTING_KEY).await {
                return Ok(secrets);
            }
        }
        let secrets = self.inner.list_secrets(ctx).await?;
        self.listing.put_default(LISTING_KEY, secrets.clone()).await;
        Ok(secrets)
    }

    async fn access_version(
        &self,
        ctx: &CallContext,
        name: &str,
        selector: &VersionSelector,
    ) -> Result<SecretVersion> {
        self.inner.access_version(ctx, name, selector).await
    }

    async fn add_version(
        &self,
        ctx: &CallContext,
        name: &str,
        payload: &[u8],
    ) -> Result<SecretVersion> {
        let result = self.inner.add_version(ctx, name, payload).await;
        self.versions.invalidate(name).await;
        result
    }

    async fn disable_version(&self, ctx: &CallContext, version_id: &str) -> Result<()> {
        let result = self.inner.disable_version(ctx, version_id).await;
        match Self::secret_name_of(version_id) {
            Some(name) => self.versions.invalidate(name).await,
            None => self.versions.clear().await,
        }
        result
    }

    async fn enable_version(&self, ctx: &CallContext, version_id: &str) -> Result<()> {
        let result = self.inner.enable_version(ctx, version_id).await;
        match Self::secret_name_of(version_id) {
            Some(name) => self.versions.invalidate(name).await,
            None => self.versions.clear().await,
        }
        result
    }

    async fn list_versions(&self, ctx: &CallContext, name: &str) -> Result<Vec<SecretVersion>> {
        if !ctx.bypass_cache() {
            if let Some(versions) = self.versions.get(name).await {
                return Ok(versions);
            }
        }
        let versions = self.inner.list_versions(ctx, name).await?;
        self.versions.put_default(name, versions.clone()).await;
        Ok(versions)
    }

    async fn record_rotation(
        &self,
        ctx: &CallContext,
        name: &str,
        rotated_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = self.inner.record_rotation(ctx, name, rotated_at).await;
        self.invalidate(name).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemorySecretStore;
    use std::time::Duration;

    async fn setup() -> (Arc<MemorySecretStore>, CachedSecretStore) {
        let store = Arc::new(MemorySecretStore::new("proj"));
        store.insert_secret(Secret::new("api-key", "")).await;
        let cached =
            CachedSecretStore::new(store.clone(), &CacheConfig::default(), MetricsRecorder::new());
        (store, cached)
    }

    #[tokio::test]
    async fn test_get_secret_served_from_cache() {
        let (store, cached) = setup().await;
        let ctx = CallContext::new();
        cached.get_secret(&ctx, "api-key").await.unwrap();
        cached.get_secret(&ctx, "api-key").await.unwrap();
        assert_eq!(store.call_count(), 1);

        cached.get_secret(&ctx.fresh(), "api-key").await.unwrap();
        assert_eq!(store.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mutation_invalidates_versions() {
        let (store, cached) = setup().await;
        let ctx = CallContext::new();
        assert!(cached.list_versions(&ctx, "api-key").await.unwrap().is_empty());

        let version = cached.add_version(&ctx, "api-key", b"v1").await.unwrap();
        let listed = cached.list_versions(&ctx, "api-key").await.unwrap();
        assert_eq!(listed.len(), 1);

        cached.disable_version(&ctx, &version.id).await.unwrap();
        let listed = cached.list_versions(&ctx, "api-key").await.unwrap();
        assert!(!listed[0].is_enabled());
        assert_eq!(store.call_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let (store, cached) = setup().await;
        let ctx = CallContext::new();
        cached.get_secret(&ctx, "api-key").await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        cached.get_secret(&ctx, "api-key").await.unwrap();
        assert_eq!(store.call_count(), 2);
    }

    #[tokio::test]
    async fn test_payload_reads_never_cached() {
        let (store, cached) = setup().await;
        let ctx = CallContext::new();
        cached.add_version(&ctx, "api-key", b"v1").await.unwrap();
        cached.access_version(&ctx, "api-key", &VersionSelector::Latest).await.unwrap();
        cached.access_version(&ctx, "api-key", &VersionSelector::Latest).await.unwrap();
        assert_eq!(store.call_count(), 3);
    }
}
