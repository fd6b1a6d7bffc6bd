//! Access control and auditing for secret payload reads.
//!
//! [`AccessGuard`] checks every `access_version` against the secret's
//! [`AccessPolicy`] and a per-principal request window before delegating, and
//! records each read in a bounded audit trail. Metadata and write operations
//! pass straight through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use super::CallContext;
use crate::config::AccessConfig;
use crate::domain::{
    AccessAuditEntry, AccessOutcome, AccessPolicy, DenialReason, Secret, SecretVersion,
    VersionSelector,
};
use crate::errors::{Result, VaultkeeperError};
use crate::observability::MetricsRecorder;
use crate::secrets::backends::SecretStore;

#[derive(Debug, Clone, Copy)]
struct RequestWindow {
    started: Instant,
    count: u32,
}

#[derive(Debug, Clone)]
pub struct AccessGuard {
    inner: Arc<dyn SecretStore>,
    policies: Arc<BTreeMap<String, AccessPolicy>>,
    service_principal: Arc<str>,
    max_requests: u32,
    window: Duration,
    /// Keyed by (principal, secret name)
    windows: Arc<DashMap<(String, String), RequestWindow>>,
    audit: Arc<Mutex<VecDeque<AccessAuditEntry>>>,
    audit_capacity: usize,
    metrics: MetricsRecorder,
}

impl AccessGuard {
    pub fn new(
        inner: Arc<dyn SecretStore>,
        config: &AccessConfig,
        metrics: MetricsRecorder,
    ) -> Self {
        Self {
            inner,
            policies: Arc::new(config.policies.clone()),
            service_principal: Arc::from(config.service_principal.as_str()),
            max_requests: config.max_requests_per_window,
            window: config.window(),
            windows: Arc::new(DashMap::new()),
            audit: Arc::new(Mutex::new(VecDeque::new())),
            audit_capacity: config.audit_capacity.max(1),
            metrics,
        }
    }

    /// Snapshot of the audit trail, oldest first.
    pub async fn audit_trail(&self) -> Vec<AccessAuditEntry> {
        self.audit.lock().await.iter().cloned().collect()
    }

    fn authorize(
        &self,
        principal: &str,
        secret: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), DenialReason> {
        if let Some(policy) = self.policies.get(secret) {
            policy.evaluate(principal, now)?;
        }
        self.admit(principal, secret)
    }

    /// Fixed-window request count per principal and secret.
    fn admit(&self, principal: &str, secret: &str) -> std::result::Result<(), DenialReason> {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry((principal.to_string(), secret.to_string()))
            .or_insert(RequestWindow { started: now, count: 0 });
        if now.duration_since(window.started) >= self.window {
            *window = RequestWindow { started: now, count: 0 };
        }
        if window.count >= self.max_requests {
            return Err(DenialReason::RateLimited);
        }
        window.count += 1;
        Ok(())
    }

    async fn record(&self, entry: AccessAuditEntry) {
        match entry.outcome {
            AccessOutcome::Denied(reason) => warn!(
                target: "vaultkeeper::audit",
                principal = %entry.principal,
                secret = %entry.secret,
                selector = %entry.selector,
                reason = %reason,
                "Secret access denied"
            ),
            outcome => info!(
                target: "vaultkeeper::audit",
                principal = %entry.principal,
                secret = %entry.secret,
                selector = %entry.selector,
                version = entry.version_id.as_deref().unwrap_or("-"),
                outcome = outcome.as_str(),
                "Secret accessed"
            ),
        }
        self.metrics.record_secret_access(entry.outcome.as_str());

        let mut audit = self.audit.lock().await;
        if audit.len() == self.audit_capacity {
            audit.pop_front();
        }
        audit.push_back(entry);
    }
}

#[async_trait]
impl SecretStore for AccessGuard {
    async fn get_secret(&self, ctx: &CallContext, name: &str) -> Result<Secret> {
        self.inner.get_secret(ctx, name).await
    }

    async fn list_secrets(&self, ctx: &CallContext) -> Result<Vec<Secret>> {
        self.inner.list_secrets(ctx).await
    }

    async fn access_version(
        &self,
        ctx: &CallContext,
        name: &str,
        selector: &VersionSelector,
    ) -> Result<SecretVersion> {
        let principal = ctx.principal().unwrap_or(&*self.service_principal);
        let at = Utc::now();
        let mut entry = AccessAuditEntry {
            at,
            principal: principal.to_string(),
            secret: name.to_string(),
            selector: selector.to_string(),
            version_id: None,
            outcome: AccessOutcome::Granted,
        };

        if let Err(reason) = self.authorize(principal, name, at) {
            entry.outcome = AccessOutcome::Denied(reason);
            self.record(entry).await;
            return Err(VaultkeeperError::access_denied(name, principal, reason));
        }

        let result = self.inner.access_version(ctx, name, selector).await;
        match &result {
            Ok(version) => entry.version_id = Some(version.id.clone()),
            Err(_) => entry.outcome = AccessOutcome::Failed,
        }
        self.record(entry).await;
        result
    }

    async fn add_version(
        &self,
        ctx: &CallContext,
        name: &str,
        payload: &[u8],
    ) -> Result<SecretVersion> {
        self.inner.add_version(ctx, name, payload).await
    }

    async fn disable_version(&self, ctx: &CallContext, version_id: &str) -> Result<()> {
        self.inner.disable_version(ctx, version_id).await
    }

    async fn enable_version(&self, ctx: &CallContext, version_id: &str) -> Result<()> {
        self.inner.enable_version(ctx, version_id).await
    }

    async fn list_versions(&self, ctx: &CallContext, name: &str) -> Result<Vec<SecretVersion>> {
        self.inner.list_versions(ctx, name).await
    }

    async fn record_rotation(
        &self,
        ctx: &CallContext,
        name: &str,
        rotated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.record_rotation(ctx, name, rotated_at).await
    }
}
