//! Drives one rotation through its stages and owns the rollback.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn, Instrument};

use super::generator::generate_credential;
use super::machine::{Journal, RotationRun, StageFailure};
use super::probes::{ProbeOutcome, ProbeSet};
use crate::config::RotationConfig;
use crate::domain::{RotationReport, RotationState, Secret};
use crate::errors::{Result, VaultkeeperError};
use crate::observability::MetricsRecorder;
use crate::resilience::CallContext;
use crate::secrets::{SecretStore, SecretString};
use crate::services::backup_archiver::BackupArchiver;
use crate::services::secret_cipher::SecretCipher;

/// Options for a single rotation.
#[derive(Debug, Clone, Default)]
pub struct RotationRequest {
    /// Skip the minimum-period check
    pub force: bool,
    /// Use this value instead of generating one
    pub new_value: Option<SecretString>,
}

impl RotationRequest {
    pub fn forced() -> Self {
        Self { force: true, new_value: None }
    }

    pub fn with_value(mut self, value: SecretString) -> Self {
        self.new_value = Some(value);
        self
    }
}

/// Per-secret locks. Rotations of different secrets never contend.
///
/// Entries are removed once released and no longer referenced.
#[derive(Debug, Default)]
struct RotationLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RotationLocks {
    fn try_acquire(&self, secret: &str) -> Option<RotationLock<'_>> {
        let lock = self.locks.entry(secret.to_string()).or_default().clone();
        let guard = lock.try_lock_owned().ok()?;
        Some(RotationLock { guard: Some(guard), secret: secret.to_string(), locks: &self.locks })
    }
}

/// Held for the whole rotation. Dropping it releases the lock and removes the
/// entry unless another caller holds a handle to it.
#[derive(Debug)]
struct RotationLock<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    secret: String,
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
}

impl Drop for RotationLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.remove_if(&self.secret, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[derive(Debug)]
pub struct RotationCoordinator {
    store: Arc<dyn SecretStore>,
    archiver: BackupArchiver,
    cipher: SecretCipher,
    probes: ProbeSet,
    config: RotationConfig,
    metrics: MetricsRecorder,
    locks: RotationLocks,
}

impl RotationCoordinator {
    pub fn new(
        store: Arc<dyn SecretStore>,
        archiver: BackupArchiver,
        cipher: SecretCipher,
        probes: ProbeSet,
        config: RotationConfig,
        metrics: MetricsRecorder,
    ) -> Self {
        Self { store, archiver, cipher, probes, config, metrics, locks: RotationLocks::default() }
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Fetch fresh metadata for `name`, then rotate it.
    pub async fn rotate_by_name(
        &self,
        ctx: &CallContext,
        name: &str,
        request: RotationRequest,
    ) -> Result<RotationReport> {
        let secret = self.store.get_secret(&ctx.fresh(), name).await?;
        self.rotate(ctx, &secret, request).await
    }

    /// Rotate `secret`.
    ///
    /// VALIDATING uses only `secret` and the lock table; a rejected rotation
    /// makes no backend calls. Failures after the new version was added are
    /// rolled back from the pre-rotation backup on a context that ignores
    /// `ctx`'s cancellation.
    pub async fn rotate(
        &self,
        ctx: &CallContext,
        secret: &Secret,
        request: RotationRequest,
    ) -> Result<RotationReport> {
        let mut journal = Journal::new(&secret.name, request.force);
        let span = journal.span();
        journal.enter(RotationState::Validating);

        let Some(_guard) = self.locks.try_acquire(&secret.name) else {
            self.metrics.record_rotation("rejected");
            return Err(VaultkeeperError::RotationInProgress { secret: secret.name.clone() });
        };

        if !request.force {
            if let Some(policy) = &secret.rotation_policy {
                let now = Utc::now();
                if policy.is_too_soon(now) {
                    self.metrics.record_rotation("rejected");
                    let next_allowed_at = policy.next_allowed_at().unwrap_or(now);
                    return Err(VaultkeeperError::RotationTooSoon {
                        secret: secret.name.clone(),
                        next_allowed_at,
                    });
                }
            }
        }

        self.execute(ctx, secret.clone(), request, journal).instrument(span).await
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        secret: Secret,
        request: RotationRequest,
        journal: Journal,
    ) -> Result<RotationReport> {
        let run = RotationRun::validated(journal, secret);
        let run = match run.back_up(ctx, &self.archiver).await {
            Ok(run) => run,
            Err(failure) => return Err(self.abort(failure)),
        };

        let credential = request
            .new_value
            .unwrap_or_else(|| generate_credential(self.config.generated_length));

        let outcome = async {
            let run = run.rotate(ctx, self.store.as_ref(), &self.cipher, credential).await?;
            let run = run.test(ctx, &self.probes).await?;
            run.verify(ctx, self.store.as_ref(), self.config.verification_window()).await
        }
        .await;

        match outcome {
            Ok(run) => {
                let (report, probe) = run.commit();
                self.metrics.record_rotation("committed");
                if let ProbeOutcome::Skipped(reason) = &probe {
                    info!(reason = %reason, "Rotation committed without connectivity test");
                }
                info!(
                    secret = %report.secret_name,
                    job_id = %report.job_id,
                    previous_version = %report.previous_version,
                    new_version = %report.new_version,
                    duration_ms = report.duration().num_milliseconds(),
                    "Rotation committed"
                );
                Ok(report)
            }
            Err(failure) => Err(self.roll_back(ctx, failure).await),
        }
    }

    /// Failure before anything was mutated.
    fn abort(&self, failure: StageFailure) -> VaultkeeperError {
        let stage = failure.stage();
        let secret = failure.journal.secret_name;
        warn!(secret = %secret, stage = %stage, error = %failure.error, "Rotation aborted");
        self.metrics.record_rotation("aborted");
        VaultkeeperError::RotationFailed { secret, stage, source: Box::new(failure.error) }
    }

    async fn roll_back(&self, ctx: &CallContext, failure: StageFailure) -> VaultkeeperError {
        let stage = failure.stage();
        let StageFailure { mut journal, error, backup, failed_version } = failure;
        let Some(backup) = backup.filter(|_| stage.requires_rollback()) else {
            return self.abort(StageFailure { journal, error, backup: None, failed_version });
        };

        warn!(
            secret = %journal.secret_name,
            stage = %stage,
            error = %error,
            failed_version = ?failed_version,
            "Rotation failed, rolling back"
        );
        let rollback_ctx = ctx.detached(self.config.rollback_timeout());
        let secret = journal.secret_name.clone();

        match self.archiver.restore(&rollback_ctx, &backup, failed_version.as_deref()).await {
            Ok(restored) => {
                journal.enter(RotationState::RolledBack);
                self.metrics.record_rotation("rolled_back");
                info!(
                    secret = %secret,
                    restored_version = %restored.id,
                    stages = ?journal.visited(),
                    "Rotation rolled back"
                );
                VaultkeeperError::RotationFailed { secret, stage, source: Box::new(error) }
            }
            Err(rollback_error) => {
                self.metrics.record_rotation("rollback_failed");
                error!(
                    secret = %secret,
                    stage = %stage,
                    backup_id = %backup.id,
                    backup_object = %backup.object_key,
                    error = %error,
                    rollback_error = %rollback_error,
                    manual_intervention = true,
                    "Rollback failed"
                );
                VaultkeeperError::RollbackFailed {
                    secret,
                    stage,
                    cause: Box::new(error),
                    rollback_error: Box::new(rollback_error),
                }
            }
        }
    }
}
