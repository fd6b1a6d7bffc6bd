//! Google Cloud REST backends
//!
//! Secret Manager, Cloud KMS and Cloud Storage are called over their JSON REST
//! APIs with a bearer token from a [`TokenProvider`]. Base URLs come from
//! [`GcpEndpoints`] so tests and emulators can point them elsewhere.
//!
//! A 401 response drops the cached token and is reported as a retryable
//! error; the retry layer then fetches a fresh token on the next attempt.

mod kms;
mod secret_manager;
mod storage;

pub use kms::GcpKms;
pub use secret_manager::GcpSecretManager;
pub use storage::GcsObjectStore;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::config::BackendConfig;
use crate::credentials::TokenProvider;
use crate::errors::{Result, VaultkeeperError};
use crate::resilience::CallContext;

/// The three GCP clients sharing one HTTP connection pool.
#[derive(Debug, Clone)]
pub struct GcpBackends {
    pub secrets: GcpSecretManager,
    pub kms: GcpKms,
    pub storage: GcsObjectStore,
}

impl GcpBackends {
    pub fn new(config: &BackendConfig, tokens: TokenProvider) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("vaultkeeper/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VaultkeeperError::config(format!("Failed to build HTTP client: {}", e)))?;
        let transport = RestTransport::new(http, tokens, config.request_timeout());

        Ok(Self {
            secrets: GcpSecretManager::new(
                transport.clone(),
                &config.endpoints.secret_manager,
                &config.project_id,
            )?,
            kms: GcpKms::new(transport.clone(), &config.endpoints.kms)?,
            storage: GcsObjectStore::new(transport, &config.endpoints.storage)?,
        })
    }
}

/// Authenticated request execution and status mapping.
#[derive(Debug, Clone)]
pub(crate) struct RestTransport {
    http: Client,
    tokens: TokenProvider,
    timeout: Duration,
}

impl RestTransport {
    pub(crate) fn new(http: Client, tokens: TokenProvider, timeout: Duration) -> Self {
        Self { http, tokens, timeout }
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    /// Send `request` with a bearer token. Non-2xx statuses become errors.
    pub(crate) async fn send(
        &self,
        ctx: &CallContext,
        operation: &str,
        resource: &str,
        request: RequestBuilder,
    ) -> Result<Response> {
        let token = self.tokens.token(ctx).await?;
        let request = request.bearer_auth(token.value.expose_secret()).timeout(self.timeout);

        let response = ctx
            .run(operation, async {
                request
                    .send()
                    .await
                    .map_err(|e| VaultkeeperError::from_reqwest(operation, resource, &e))
            })
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
            return Err(VaultkeeperError::transient(
                operation,
                resource,
                "credential rejected (HTTP 401)",
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VaultkeeperError::from_status(operation, resource, status.as_u16(), &body));
        }
        Ok(response)
    }

    pub(crate) async fn json<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        operation: &str,
        resource: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let response = self.send(ctx, operation, resource, request).await?;
        ctx.run(operation, async {
            response.json::<T>().await.map_err(|e| {
                VaultkeeperError::backend(
                    operation,
                    resource,
                    format!("invalid response body: {}", e),
                    false,
                )
            })
        })
        .await
    }
}

pub(crate) fn parse_base(base: &str) -> Result<Url> {
    Url::parse(base.trim_end_matches('/'))
        .map_err(|e| VaultkeeperError::config(format!("Invalid endpoint '{}': {}", base, e)))
}

/// Append `segments` (percent-encoded) to `base`.
pub(crate) fn join_segments<'a>(
    base: &Url,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| VaultkeeperError::config(format!("Endpoint '{}' cannot be a base", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// GCP encodes int64 checksums as JSON strings; emulators sometimes send numbers.
pub(crate) fn deserialize_crc<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => s.parse::<u32>().map(Some).map_err(D::Error::custom),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| D::Error::custom("crc32c out of range")),
        Some(other) => Err(D::Error::custom(format!("unexpected crc32c value: {}", other))),
    }
}
