//! Compliance scanning and the periodic audit
//!
//! [`ComplianceScanner::scan`] is a pure function of a [`Secret`] and the
//! current time. Every check runs; none short-circuits another. Severities
//! come from a fixed mapping:
//!
//! | Check | Severity |
//! |---|---|
//! | encryption not configured | CRITICAL |
//! | accessible to `allUsers` / `allAuthenticatedUsers` | CRITICAL |
//! | rotation policy missing or overdue | HIGH |
//! | no audit log destination | HIGH |
//! | replication unspecified | MEDIUM |
//! | required labels missing | MEDIUM |
//! | no backup policy | MEDIUM |
//! | backup cadence longer than allowed | LOW |
//!
//! [`ComplianceAuditor`] runs the scanner across the store and owns the one
//! remediation that mutates anything, [`ComplianceAuditor::remediate_stale_versions`].

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use super::backup_archiver::BackupArchiver;
use crate::config::ComplianceConfig;
use crate::domain::{
    BackupRecord, ComplianceCheck, ComplianceResult, Secret, Severity, Violation,
};
use crate::errors::Result;
use crate::observability::MetricsRecorder;
use crate::resilience::CallContext;
use crate::secrets::SecretStore;

/// IAM principals that make a secret readable outside the organisation
pub const PUBLIC_MEMBERS: [&str; 2] = ["allUsers", "allAuthenticatedUsers"];

#[derive(Debug, Clone, Default)]
pub struct ComplianceScanner {
    config: ComplianceConfig,
}

impl ComplianceScanner {
    pub fn new(config: ComplianceConfig) -> Self {
        Self { config }
    }

    /// Evaluate every check against `secret`. Never touches a backend.
    pub fn scan(&self, secret: &Secret, now: DateTime<Utc>) -> ComplianceResult {
        let mut violations = Vec::new();

        if let Some(v) = self.check_rotation(secret, now) {
            violations.push(v);
        }
        if secret.encryption.is_none() {
            violations.push(Violation::new(
                ComplianceCheck::Encryption,
                Severity::Critical,
                "No customer-managed encryption key configured",
            ));
        }
        if secret.audit_log_destination.as_deref().is_none_or(str::is_empty) {
            violations.push(Violation::new(
                ComplianceCheck::AuditLog,
                Severity::High,
                "No audit log destination configured",
            ));
        }
        if !secret.replication.is_configured() {
            violations.push(Violation::new(
                ComplianceCheck::Replication,
                Severity::Medium,
                "Replication policy is unspecified",
            ));
        }
        if let Some(v) = self.check_labels(secret) {
            violations.push(v);
        }
        violations.extend(self.check_backup(secret));
        if let Some(v) = check_public_exposure(secret) {
            violations.push(v);
        }

        ComplianceResult::new(&secret.name, now, violations)
    }

    fn check_rotation(&self, secret: &Secret, now: DateTime<Utc>) -> Option<Violation> {
        let Some(policy) = &secret.rotation_policy else {
            return Some(Violation::new(
                ComplianceCheck::RotationPolicy,
                Severity::High,
                "No rotation policy configured",
            ));
        };

        // A never-rotated secret is measured from its creation time.
        let period = chrono::Duration::from_std(policy.period).ok()?;
        let due_at = policy
            .next_allowed_at()
            .or_else(|| secret.created_at.and_then(|c| c.checked_add_signed(period)))?;
        (now > due_at).then(|| {
            Violation::new(
                ComplianceCheck::RotationPolicy,
                Severity::High,
                format!("Rotation overdue since {}", due_at.to_rfc3339()),
            )
        })
    }

    fn check_labels(&self, secret: &Secret) -> Option<Violation> {
        let missing: Vec<&str> = self
            .config
            .required_labels
            .iter()
            .filter(|label| secret.labels.get(*label).is_none_or(|v| v.trim().is_empty()))
            .map(String::as_str)
            .collect();
        (!missing.is_empty()).then(|| {
            Violation::new(
                ComplianceCheck::RequiredLabels,
                Severity::Medium,
                format!("Missing required labels: {}", missing.join(", ")),
            )
        })
    }

    fn check_backup(&self, secret: &Secret) -> Option<Violation> {
        let Some(policy) = &secret.backup_policy else {
            return Some(Violation::new(
                ComplianceCheck::BackupPolicy,
                Severity::Medium,
                "No backup policy configured",
            ));
        };
        let max = Duration::from_secs(self.config.max_backup_interval_hours * 3600);
        (policy.interval > max).then(|| {
            Violation::new(
                ComplianceCheck::BackupPolicy,
                Severity::Low,
                format!(
                    "Backup interval {}h exceeds the allowed {}h",
                    policy.interval.as_secs() / 3600,
                    self.config.max_backup_interval_hours
                ),
            )
        })
    }
}

fn check_public_exposure(secret: &Secret) -> Option<Violation> {
    let public: Vec<&str> = secret
        .access_members
        .iter()
        .map(String::as_str)
        .filter(|m| PUBLIC_MEMBERS.contains(m))
        .collect();
    (!public.is_empty()).then(|| {
        Violation::new(
            ComplianceCheck::PublicExposure,
            Severity::Critical,
            format!("Secret is accessible to {}", public.join(", ")),
        )
    })
}

/// A secret the auditor could not scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditFailure {
    pub secret_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuditReport {
    pub results: Vec<ComplianceResult>,
    pub failures: Vec<AuditFailure>,
}

impl AuditReport {
    pub fn failed_secrets(&self) -> impl Iterator<Item = &ComplianceResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// Outcome of [`ComplianceAuditor::remediate_stale_versions`].
#[derive(Debug, Clone)]
pub struct RemediationReport {
    pub backup: BackupRecord,
    pub disabled_versions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ComplianceAuditor {
    store: Arc<dyn SecretStore>,
    scanner: ComplianceScanner,
    archiver: BackupArchiver,
    metrics: MetricsRecorder,
}

impl ComplianceAuditor {
    pub fn new(
        store: Arc<dyn SecretStore>,
        scanner: ComplianceScanner,
        archiver: BackupArchiver,
        metrics: MetricsRecorder,
    ) -> Self {
        Self { store, scanner, archiver, metrics }
    }

    pub fn scanner(&self) -> &ComplianceScanner {
        &self.scanner
    }

    /// Scan one secret using fresh metadata; cached entries are skipped.
    pub async fn audit_secret(&self, ctx: &CallContext, name: &str) -> Result<ComplianceResult> {
        let secret = self.store.get_secret(&ctx.fresh(), name).await?;
        let result = self.scanner.scan(&secret, Utc::now());
        for violation in &result.violations {
            let (check, severity) = (violation.check.as_str(), violation.severity.as_str());
            self.metrics.record_compliance_violation(check, severity);
        }
        if !result.passed {
            warn!(
                secret = %name,
                violations = result.violations.len(),
                highest = ?result.highest_severity(),
                "Secret failed compliance scan"
            );
        }
        Ok(result)
    }

    /// Scan every listed secret. Per-secret failures are collected, not fatal.
    #[instrument(skip(self, ctx))]
    pub async fn audit_all(&self, ctx: &CallContext) -> Result<AuditReport> {
        let secrets = self.store.list_secrets(ctx).await?;
        let mut report = AuditReport::default();

        for secret in secrets {
            ctx.check("compliance_audit")?;
            match self.audit_secret(ctx, &secret.name).await {
                Ok(result) => report.results.push(result),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(secret = %secret.name, error = %e, "Compliance scan failed");
                    report
                        .failures
                        .push(AuditFailure { secret_name: secret.name, error: e.to_string() });
                }
            }
        }

        info!(
            scanned = report.results.len(),
            failed_scans = report.failures.len(),
            non_compliant = report.failed_secrets().count(),
            "Compliance audit complete"
        );
        Ok(report)
    }

    /// Audit on a fixed interval until `ctx` is cancelled.
    pub async fn run(&self, ctx: &CallContext, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ctx.done() => {
                    info!("Compliance auditor stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.audit_all(ctx).await {
                if e.is_cancelled() {
                    return;
                }
                error!(error = %e, "Background compliance audit failed");
            }
        }
    }

    /// Back up, then disable every enabled version other than the latest.
    ///
    /// Nothing is disabled unless the backup succeeded.
    #[instrument(skip(self, ctx))]
    pub async fn remediate_stale_versions(
        &self,
        ctx: &CallContext,
        name: &str,
    ) -> Result<RemediationReport> {
        let backup = self.archiver.backup(ctx, name).await?;
        let versions = self.store.list_versions(&ctx.fresh(), name).await?;

        let mut disabled_versions = Vec::new();
        for version in versions.iter().skip(1).filter(|v| v.is_enabled()) {
            self.store.disable_version(ctx, &version.id).await?;
            disabled_versions.push(version.id.clone());
        }

        info!(
            secret = %name,
            backup_id = %backup.id,
            disabled = disabled_versions.len(),
            "Stale versions disabled"
        );
        Ok(RemediationReport { backup, disabled_versions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;
    use crate::domain::{
        BackupPolicy, EncryptionConfig, ReplicationMode, RotationPolicy, VersionState,
    };
    use crate::services::SecretCipher;
    use crate::secrets::{MemoryObjectStore, MemorySecretStore};

    fn conforming(now: DateTime<Utc>) -> Secret {
        let mut secret = Secret::new("api-key", "projects/p/secrets/api-key")
            .with_label("owner", "payments")
            .with_label("environment", "prod")
            .with_rotation_policy(RotationPolicy {
                period: Duration::from_secs(30 * 24 * 3600),
                last_rotated_at: Some(now - chrono::Duration::days(1)),
            });
        secret.replication = ReplicationMode::Automatic;
        secret.encryption = Some(EncryptionConfig { kms_key_name: "projects/p/k".to_string() });
        secret.audit_log_destination = Some("projects/p/topics/audit".to_string());
        secret.backup_policy =
            Some(BackupPolicy { interval: Duration::from_secs(6 * 3600), retention_days: 30 });
        secret
    }

    #[test]
    fn test_conforming_secret_passes() {
        let now = Utc::now();
        let result = ComplianceScanner::default().scan(&conforming(now), now);
        assert!(result.passed);
        assert!(result.violations.is_empty());
    }

    #[test]
    fn test_missing_encryption_fails() {
        let now = Utc::now();
        let mut secret = conforming(now);
        secret.encryption = None;
        let result = ComplianceScanner::default().scan(&secret, now);
        assert!(!result.passed);
        assert_eq!(result.highest_severity(), Some(Severity::Critical));
        assert!(result.has_violation(ComplianceCheck::Encryption));
    }

    #[test]
    fn test_bare_secret_reports_every_check() {
        let now = Utc::now();
        let result = ComplianceScanner::default().scan(&Secret::new("bare", ""), now);
        let checks: Vec<_> = result.violations.iter().map(|v| v.check).collect();
        assert_eq!(
            checks,
            vec![
                ComplianceCheck::RotationPolicy,
                ComplianceCheck::Encryption,
                ComplianceCheck::AuditLog,
                ComplianceCheck::Replication,
                ComplianceCheck::RequiredLabels,
                ComplianceCheck::BackupPolicy,
            ]
        );
        assert!(!result.passed);
    }

    #[test]
    fn test_overdue_rotation_is_high() {
        let now = Utc::now();
        let mut secret = conforming(now);
        secret.rotation_policy = Some(RotationPolicy {
            period: Duration::from_secs(24 * 3600),
            last_rotated_at: Some(now - chrono::Duration::days(3)),
        });
        let result = ComplianceScanner::default().scan(&secret, now);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].severity, Severity::High);
    }

    #[test]
    fn test_never_rotated_measured_from_creation() {
        let now = Utc::now();
        let mut secret = conforming(now);
        secret.rotation_policy = Some(RotationPolicy::new(Duration::from_secs(24 * 3600)));
        secret.created_at = Some(now - chrono::Duration::hours(2));
        assert!(ComplianceScanner::default().scan(&secret, now).passed);

        secret.created_at = Some(now - chrono::Duration::days(2));
        assert!(!ComplianceScanner::default().scan(&secret, now).passed);
    }

    #[test]
    fn test_labels_and_backup_cadence_do_not_fail_scan() {
        let now = Utc::now();
        let mut secret = conforming(now);
        secret.labels.remove("environment");
        secret.backup_policy =
            Some(BackupPolicy { interval: Duration::from_secs(72 * 3600), retention_days: 7 });

        let result = ComplianceScanner::default().scan(&secret, now);
        assert!(result.passed);
        assert_eq!(result.violations.len(), 2);
        assert!(result.violations[0].message.contains("environment"));
        assert_eq!(result.violations[1].severity, Severity::Low);
    }

    #[test]
    fn test_public_members_are_critical() {
        let now = Utc::now();
        let mut secret = conforming(now);
        secret.access_members = vec!["user:a@example.com".into(), "allAuthenticatedUsers".into()];
        let result = ComplianceScanner::default().scan(&secret, now);
        assert!(!result.passed);
        assert!(result.has_violation(ComplianceCheck::PublicExposure));
    }

    async fn auditor() -> (Arc<MemorySecretStore>, ComplianceAuditor) {
        let store = Arc::new(MemorySecretStore::new("p"));
        let archiver = BackupArchiver::new(
            store.clone(),
            Arc::new(MemoryObjectStore::new()),
            SecretCipher::unconfigured(),
            BackupConfig { encrypt: false, ..BackupConfig::default() },
        );
        let auditor = ComplianceAuditor::new(
            store.clone(),
            ComplianceScanner::default(),
            archiver,
            MetricsRecorder::new(),
        );
        (store, auditor)
    }

    #[tokio::test]
    async fn test_audit_all_scans_every_secret() {
        let (store, auditor) = auditor().await;
        let now = Utc::now();
        store.insert_secret(conforming(now)).await;
        store.insert_secret(Secret::new("bare", "")).await;

        let report = auditor.audit_all(&CallContext::new()).await.unwrap();
        assert_eq!(report.results.len(), 2);
        assert!(report.failures.is_empty());
        let failed: Vec<_> = report.failed_secrets().map(|r| r.secret_name.as_str()).collect();
        assert_eq!(failed, vec!["bare"]);
    }

    #[tokio::test]
    async fn test_audit_reads_past_cached_metadata() {
        let store = Arc::new(MemorySecretStore::new("p"));
        let cached: Arc<dyn SecretStore> = Arc::new(crate::resilience::CachedSecretStore::new(
            store.clone(),
            &crate::config::CacheConfig::default(),
            MetricsRecorder::new(),
        ));
        let archiver = BackupArchiver::new(
            cached.clone(),
            Arc::new(MemoryObjectStore::new()),
            SecretCipher::unconfigured(),
            BackupConfig { encrypt: false, ..BackupConfig::default() },
        );
        let auditor = ComplianceAuditor::new(
            cached.clone(),
            ComplianceScanner::default(),
            archiver,
            MetricsRecorder::new(),
        );
        let ctx = CallContext::new();
        store.insert_secret(conforming(Utc::now())).await;
        assert!(cached.get_secret(&ctx, "api-key").await.unwrap().encryption.is_some());

        // Encryption removed out of band; the cache still holds the old metadata.
        let mut changed = conforming(Utc::now());
        changed.encryption = None;
        store.insert_secret(changed).await;
        assert!(cached.get_secret(&ctx, "api-key").await.unwrap().encryption.is_some());

        let result = auditor.audit_secret(&ctx, "api-key").await.unwrap();
        assert!(!result.passed);
        assert!(result.violations.iter().any(|v| v.check == ComplianceCheck::Encryption));
    }

    #[tokio::test]
    async fn test_remediation_keeps_latest_only() {
        let (store, auditor) = auditor().await;
        let ctx = CallContext::new();
        store.insert_secret(Secret::new("token", "")).await;
        for payload in [b"a", b"b", b"c"] {
            store.add_version(&ctx, "token", payload).await.unwrap();
        }

        let report = auditor.remediate_stale_versions(&ctx, "token").await.unwrap();
        assert_eq!(report.disabled_versions.len(), 2);
        assert!(report.backup.version_id.ends_with("/versions/3"));

        let states: Vec<_> =
            store.snapshot_versions("token").await.iter().map(|v| v.state).collect();
        assert_eq!(
            states,
            vec![VersionState::Disabled, VersionState::Disabled, VersionState::Enabled]
        );
    }

    #[tokio::test]
    async fn test_remediation_aborts_when_backup_fails() {
        let (store, auditor) = auditor().await;
        let ctx = CallContext::new();
        store.insert_secret(Secret::new("token", "")).await;
        store.add_version(&ctx, "token", b"a").await.unwrap();
        store.add_version(&ctx, "token", b"b").await.unwrap();
        store.fail_next(
            "access_version",
            crate::errors::VaultkeeperError::backend("access_version", "token", "boom", false),
        );

        assert!(auditor.remediate_stale_versions(&ctx, "token").await.is_err());
        assert!(store.snapshot_versions("token").await.iter().all(|v| v.is_enabled()));
    }
}
