use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::CredentialToken;
use crate::errors::Result;
use crate::resilience::CallContext;

use super::resolver::CredentialResolver;
use super::source::CredentialSource;

/// Caches the resolved token for a single source and refreshes it once it
/// falls inside the resolver's grace window.
#[derive(Debug, Clone)]
pub struct TokenProvider {
    resolver: CredentialResolver,
    source: CredentialSource,
    cached: Arc<RwLock<Option<CredentialToken>>>,
}

impl TokenProvider {
    pub fn new(resolver: CredentialResolver, source: CredentialSource) -> Self {
        Self { resolver, source, cached: Arc::new(RwLock::new(None)) }
    }

    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    pub async fn token(&self, ctx: &CallContext) -> Result<CredentialToken> {
        let grace = self.resolver.grace();
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref().filter(|t| t.is_usable(grace)) {
                return Ok(token.clone());
            }
        }

        // Resolve outside the lock so a slow source does not block readers.
        let token = self.resolver.resolve(ctx, &self.source).await?;
        debug!(source = %token.source, "Refreshed cached credential");
        *self.cached.write().await = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token, e.g. after the backend answered 401.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}
