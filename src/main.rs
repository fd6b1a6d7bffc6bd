use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vaultkeeper::{
    config::{AppConfig, BackendKind},
    credentials::{CredentialResolver, TokenProvider},
    observability::{init_observability, log_config_info, MetricsRecorder},
    resilience::{
        AccessGuard, BackendGateway, CachedSecretStore, CallContext, ResilientKms,
        ResilientObjectStore, ResilientSecretStore,
    },
    secrets::{
        GcpBackends, KmsClient, MemoryKms, MemoryObjectStore, MemorySecretStore, ObjectStore,
        SecretStore,
    },
    services::{
        BackupArchiver, ComplianceAuditor, ComplianceScanner, ProbeSet, RotationCoordinator,
        RotationScheduler, SecretCipher,
    },
    APP_NAME, VERSION,
};

/// Key name used by the in-memory KMS when none is configured
const LOCAL_KMS_KEY: &str = "projects/local/locations/global/keyRings/local/cryptoKeys/dev";

struct Backends {
    store: Arc<dyn SecretStore>,
    kms: Option<Arc<dyn KmsClient>>,
    key_name: Option<String>,
    objects: Arc<dyn ObjectStore>,
}

fn raw_backends(config: &AppConfig, metrics: &MetricsRecorder) -> anyhow::Result<Backends> {
    match config.backend.kind {
        BackendKind::Gcp => {
            let source = config
                .credentials
                .source
                .clone()
                .context("credentials.source is required for the gcp backend")?;
            let resolver = CredentialResolver::new(metrics.clone())?
                .with_grace(Duration::from_secs(config.credentials.expiry_grace_seconds));
            let gcp = GcpBackends::new(&config.backend, TokenProvider::new(resolver, source))?;
            let kms: Option<Arc<dyn KmsClient>> = config
                .kms
                .key_name
                .is_some()
                .then(|| Arc::new(gcp.kms.clone()) as Arc<dyn KmsClient>);
            Ok(Backends {
                store: Arc::new(gcp.secrets),
                kms,
                key_name: config.kms.key_name.clone(),
                objects: Arc::new(gcp.storage),
            })
        }
        BackendKind::Memory => {
            warn!("Using in-memory backends; all secrets are lost on exit");
            let project = match config.backend.project_id.as_str() {
                "" => "local",
                project => project,
            };
            Ok(Backends {
                store: Arc::new(MemorySecretStore::new(project)),
                kms: Some(Arc::new(MemoryKms::new())),
                key_name: Some(
                    config.kms.key_name.clone().unwrap_or_else(|| LOCAL_KMS_KEY.to_string()),
                ),
                objects: Arc::new(MemoryObjectStore::new()),
            })
        }
    }
}

/// Wrap every backend in rate limiting and retries, and the store in the cache
/// and, when enabled, the access guard.
fn resilient_backends(config: &AppConfig, metrics: &MetricsRecorder, raw: Backends) -> Backends {
    let gateway = BackendGateway::from_config(config, metrics.clone());

    let mut store: Arc<dyn SecretStore> =
        Arc::new(ResilientSecretStore::new(raw.store, gateway.clone()));
    if config.cache.enabled {
        store = Arc::new(CachedSecretStore::new(store, &config.cache, metrics.clone()));
    }
    if config.access.enabled {
        info!(policies = config.access.policies.len(), "Secret access control enabled");
        store = Arc::new(AccessGuard::new(store, &config.access, metrics.clone()));
    }

    Backends {
        store,
        kms: raw
            .kms
            .map(|kms| Arc::new(ResilientKms::new(kms, gateway.clone())) as Arc<dyn KmsClient>),
        key_name: raw.key_name,
        objects: Arc::new(ResilientObjectStore::new(raw.objects, gateway)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists; must happen before configuration is read
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let config_path = std::env::var("VAULTKEEPER_CONFIG_FILE").ok().map(PathBuf::from);
    let config =
        AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    let metrics = init_observability(&config.observability)?;

    info!(app_name = APP_NAME, version = VERSION, "Starting vaultkeeper");
    log_config_info(&config);

    let backends = resilient_backends(&config, &metrics, raw_backends(&config, &metrics)?);
    let cipher = SecretCipher::from_parts(backends.kms.clone(), backends.key_name.clone());
    if !cipher.is_configured() {
        warn!("No KMS key configured; rotations and encrypted backups will fail");
    }

    let archiver = BackupArchiver::new(
        backends.store.clone(),
        backends.objects.clone(),
        cipher.clone(),
        config.backup.clone(),
    );
    let coordinator = Arc::new(RotationCoordinator::new(
        backends.store.clone(),
        archiver.clone(),
        cipher,
        ProbeSet::standard(&config.rotation)?,
        config.rotation.clone(),
        metrics.clone(),
    ));
    let auditor = ComplianceAuditor::new(
        backends.store.clone(),
        ComplianceScanner::new(config.compliance.clone()),
        archiver,
        metrics,
    );

    let shutdown = CancellationToken::new();
    let ctx = CallContext::from_token(shutdown.clone())
        .with_principal(config.access.service_principal.as_str());
    let mut tasks = Vec::new();

    if config.rotation.schedule_interval_seconds > 0 {
        let scheduler = RotationScheduler::new(coordinator.clone());
        let interval = Duration::from_secs(config.rotation.schedule_interval_seconds);
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move { scheduler.run(&ctx, interval).await }));
        info!(interval_secs = interval.as_secs(), "Rotation scheduler started");
    }

    if config.compliance.audit_interval_seconds > 0 {
        let interval = Duration::from_secs(config.compliance.audit_interval_seconds);
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move { auditor.run(&ctx, interval).await }));
        info!(interval_secs = interval.as_secs(), "Compliance auditor started");
    }

    signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task panicked");
        }
    }

    info!("vaultkeeper stopped");
    Ok(())
}
