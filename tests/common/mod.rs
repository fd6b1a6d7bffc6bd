//! Shared fixtures for the integration tests.
//!
//! Builds the full service stack over the in-memory backends so tests can
//! drive rotations end to end and inspect the stored versions directly.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use vaultkeeper::config::{AccessConfig, BackupConfig, RotationConfig};
use vaultkeeper::domain::{Secret, SecretType};
use vaultkeeper::errors::{Result, VaultkeeperError};
use vaultkeeper::observability::MetricsRecorder;
use vaultkeeper::resilience::{AccessGuard, BackendGateway, CallContext, ResilientSecretStore};
use vaultkeeper::secrets::{MemoryKms, MemoryObjectStore, MemorySecretStore, SecretStore};
use vaultkeeper::secrets::SecretString;
use vaultkeeper::services::rotation::{ConnectivityProbe, ProbeOutcome, ProbeSet};
use vaultkeeper::services::{BackupArchiver, RotationCoordinator, SecretCipher};

pub const KMS_KEY: &str = "projects/test/locations/global/keyRings/ring/cryptoKeys/key";
pub const ORIGINAL_PAYLOAD: &[u8] = b"pre-rotation-password";

/// What the scripted probe does when called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeBehavior {
    Pass,
    Fail,
    /// Signal `entered`, then wait for `release` before passing
    Block,
}

#[derive(Debug)]
pub struct ScriptedProbe {
    behavior: std::sync::Mutex<ProbeBehavior>,
    calls: AtomicU32,
    pub entered: Notify,
    pub release: Notify,
}

impl ScriptedProbe {
    pub fn new(behavior: ProbeBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: std::sync::Mutex::new(behavior),
            calls: AtomicU32::new(0),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    pub fn set_behavior(&self, behavior: ProbeBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProbe for ScriptedProbe {
    async fn probe(
        &self,
        _ctx: &CallContext,
        secret: &Secret,
        _credential: &SecretString,
    ) -> Result<ProbeOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            ProbeBehavior::Pass => Ok(ProbeOutcome::Passed),
            ProbeBehavior::Fail => Err(VaultkeeperError::backend(
                "connectivity_test",
                &secret.name,
                "new credential rejected",
                false,
            )),
            ProbeBehavior::Block => {
                self.entered.notify_one();
                self.release.notified().await;
                Ok(ProbeOutcome::Passed)
            }
        }
    }
}

pub struct Harness {
    pub raw_store: Arc<MemorySecretStore>,
    pub store: Arc<dyn SecretStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub kms: Arc<MemoryKms>,
    pub cipher: SecretCipher,
    pub probe: Arc<ScriptedProbe>,
    pub coordinator: Arc<RotationCoordinator>,
    /// Present when the store is wrapped in access control
    pub guard: Option<AccessGuard>,
}

impl Harness {
    /// Stack without retries or rate limiting.
    pub async fn new(probe: ProbeBehavior) -> Self {
        Self::with_gateway(probe, BackendGateway::passthrough()).await
    }

    pub async fn with_gateway(probe: ProbeBehavior, gateway: BackendGateway) -> Self {
        Self::build(probe, gateway, None)
    }

    /// Stack whose store sits behind an [`AccessGuard`].
    pub async fn with_access(probe: ProbeBehavior, access: AccessConfig) -> Self {
        Self::build(probe, BackendGateway::passthrough(), Some(access))
    }

    fn build(probe: ProbeBehavior, gateway: BackendGateway, access: Option<AccessConfig>) -> Self {
        let raw_store = Arc::new(MemorySecretStore::new("test"));
        let mut store: Arc<dyn SecretStore> =
            Arc::new(ResilientSecretStore::new(raw_store.clone(), gateway));
        let guard = access
            .map(|config| AccessGuard::new(store.clone(), &config, MetricsRecorder::new()));
        if let Some(guard) = &guard {
            store = Arc::new(guard.clone());
        }
        let objects = Arc::new(MemoryObjectStore::new());
        let kms = Arc::new(MemoryKms::new());
        let cipher = SecretCipher::new(kms.clone(), KMS_KEY);
        let archiver = BackupArchiver::new(
            store.clone(),
            objects.clone(),
            cipher.clone(),
            BackupConfig::default(),
        );

        let probe = ScriptedProbe::new(probe);
        let config = RotationConfig::default();
        let probes = ProbeSet::new(probe.clone(), probe.clone(), probe.clone(), &config);
        let coordinator = Arc::new(RotationCoordinator::new(
            store.clone(),
            archiver,
            cipher.clone(),
            probes,
            config,
            MetricsRecorder::new(),
        ));

        Self { raw_store, store, objects, kms, cipher, probe, coordinator, guard }
    }

    /// Register a database secret with one version holding [`ORIGINAL_PAYLOAD`].
    pub async fn seed(&self, secret: Secret) -> Secret {
        let name = secret.name.clone();
        self.raw_store.insert_secret(secret.with_type(SecretType::Database)).await;
        self.raw_store.add_version(&CallContext::new(), &name, ORIGINAL_PAYLOAD).await.unwrap();
        self.raw_store.get_secret(&CallContext::new(), &name).await.unwrap()
    }
}
