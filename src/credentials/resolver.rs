use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use crate::domain::{CredentialToken, DEFAULT_EXPIRY_GRACE};
use crate::errors::{Result, VaultkeeperError};
use crate::observability::MetricsRecorder;
use crate::resilience::CallContext;

use super::executable::resolve_executable;
use super::metadata::MetadataClient;
use super::runner::{CommandRunner, TokioCommandRunner};
use super::source::CredentialSource;

/// Turns a [`CredentialSource`] into a usable bearer token.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    runner: Arc<dyn CommandRunner>,
    metadata: MetadataClient,
    grace: Duration,
}

impl CredentialResolver {
    pub fn new(metrics: MetricsRecorder) -> Result<Self> {
        Ok(Self {
            runner: Arc::new(TokioCommandRunner),
            metadata: MetadataClient::new(metrics)?,
            grace: DEFAULT_EXPIRY_GRACE,
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Resolve a token. Tokens that expire within the grace window are
    /// rejected with `CredentialExpired` rather than handed out.
    #[instrument(skip(self, ctx, source), fields(source = %source.kind()))]
    pub async fn resolve(
        &self,
        ctx: &CallContext,
        source: &CredentialSource,
    ) -> Result<CredentialToken> {
        ctx.check("resolve_credential")?;

        let token = match source {
            CredentialSource::Static(s) => {
                CredentialToken::new(s.token.clone(), s.expires_at, source.kind())
            }
            CredentialSource::Executable(s) => {
                resolve_executable(self.runner.as_ref(), ctx, s).await?
            }
            CredentialSource::MetadataService(s) => self.metadata.fetch(ctx, s).await?,
        };

        if !token.is_usable_at(Utc::now(), self.grace) {
            return Err(VaultkeeperError::CredentialExpired {
                source_kind: token.source,
                expires_at: token.expires_at,
            });
        }

        info!(expires_at = %token.expires_at, "Resolved credential");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::source::StaticSource;
    use crate::domain::CredentialSourceKind;
    use crate::secrets::SecretString;
    use chrono::Duration as ChronoDuration;

    fn resolver() -> CredentialResolver {
        CredentialResolver::new(MetricsRecorder::new()).unwrap()
    }

    fn static_source(expires_in: ChronoDuration) -> CredentialSource {
        CredentialSource::Static(StaticSource {
            token: SecretString::new("static-token"),
            expires_at: Utc::now() + expires_in,
        })
    }

    #[tokio::test]
    async fn test_static_token_resolves() {
        let token = resolver()
            .resolve(&CallContext::new(), &static_source(ChronoDuration::hours(1)))
            .await
            .unwrap();
        assert_eq!(token.value.expose_secret(), "static-token");
        assert_eq!(token.source, CredentialSourceKind::Static);
    }

    #[tokio::test]
    async fn test_token_inside_grace_window_is_expired() {
        let err = resolver()
            .resolve(&CallContext::new(), &static_source(ChronoDuration::seconds(10)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VaultkeeperError::CredentialExpired { source_kind: CredentialSourceKind::Static, .. }
        ));
    }

    #[tokio::test]
    async fn test_custom_grace() {
        let resolver = resolver().with_grace(Duration::from_secs(1));
        let token = resolver
            .resolve(&CallContext::new(), &static_source(ChronoDuration::seconds(10)))
            .await;
        assert!(token.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_before_resolution() {
        let ctx = CallContext::new();
        ctx.cancel();
        let err = resolver()
            .resolve(&ctx, &static_source(ChronoDuration::hours(1)))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
