//! Cloud instance-metadata credential fetches.
//!
//! AWS uses an IMDSv2 session token. If the session request fails the client
//! falls back to an IMDSv1 request, logging a warning and counting the
//! fallback so the downgrade is never silent. A cancelled context aborts
//! instead of falling back.

use chrono::Utc;
use reqwest::{Client, RequestBuilder};
use tracing::{debug, warn};

use crate::domain::{CredentialSourceKind, CredentialToken};
use crate::errors::{Result, VaultkeeperError};
use crate::observability::MetricsRecorder;
use crate::resilience::CallContext;

use super::parse::parse_token;
use super::source::{MetadataProvider, MetadataSource};

const KIND: CredentialSourceKind = CredentialSourceKind::MetadataService;
const AWS_SESSION_PATH: &str = "/latest/api/token";
const AWS_SESSION_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const AWS_SESSION_TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";

#[derive(Debug, Clone)]
pub struct MetadataClient {
    http: Client,
    metrics: MetricsRecorder,
}

impl MetadataClient {
    pub fn new(metrics: MetricsRecorder) -> Result<Self> {
        // Metadata endpoints are link-local and must never go through a proxy.
        let http = Client::builder().no_proxy().build().map_err(|e| {
            VaultkeeperError::config(format!("failed to build metadata HTTP client: {}", e))
        })?;
        Ok(Self { http, metrics })
    }

    pub async fn fetch(
        &self,
        ctx: &CallContext,
        source: &MetadataSource,
    ) -> Result<CredentialToken> {
        let session = match source.provider {
            MetadataProvider::Aws => self.aws_session_token(ctx, source).await?,
            MetadataProvider::Azure | MetadataProvider::Gcp => None,
        };

        let url = source.token_url();
        let mut request = self.with_headers(self.http.get(&url), source);
        if let Some(session) = &session {
            request = request.header(AWS_SESSION_TOKEN_HEADER, session);
        }

        debug!(provider = %source.provider, url = %url, "Fetching metadata credential");
        let body = ctx
            .run("metadata_credential", async {
                let response = request.send().await.map_err(|e| transport_error(&url, &e))?;
                let status = response.status();
                let body = response.text().await.map_err(|e| transport_error(&url, &e))?;
                if !status.is_success() {
                    return Err(VaultkeeperError::credential_source(
                        KIND,
                        format!(
                            "{} metadata returned HTTP {}: {}",
                            source.provider,
                            status.as_u16(),
                            body.chars().take(256).collect::<String>()
                        ),
                    ));
                }
                Ok(body)
            })
            .await?;

        parse_token(
            KIND,
            &body,
            source.output_format,
            source.token_field.as_deref(),
            source.default_ttl_seconds,
            Utc::now(),
        )
    }

    /// `Ok(None)` means IMDSv2 is unavailable and the caller proceeds with IMDSv1.
    async fn aws_session_token(
        &self,
        ctx: &CallContext,
        source: &MetadataSource,
    ) -> Result<Option<String>> {
        let url = format!("{}{}", source.base_url(), AWS_SESSION_PATH);
        let request = self
            .http
            .put(&url)
            .header(AWS_SESSION_TTL_HEADER, source.session_ttl_seconds.to_string())
            .timeout(source.timeout());

        let result = ctx
            .run("imds_session_token", async {
                let response = request.send().await.map_err(|e| transport_error(&url, &e))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(VaultkeeperError::credential_source(
                        KIND,
                        format!("IMDSv2 session request returned HTTP {}", status.as_u16()),
                    ));
                }
                response.text().await.map_err(|e| transport_error(&url, &e))
            })
            .await;

        match result {
            Ok(token) if !token.trim().is_empty() => Ok(Some(token.trim().to_string())),
            Ok(_) => {
                self.record_fallback("empty IMDSv2 session token");
                Ok(None)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                self.record_fallback(&e.to_string());
                Ok(None)
            }
        }
    }

    fn record_fallback(&self, reason: &str) {
        warn!(
            provider = "aws",
            reason = %reason,
            "IMDSv2 session token unavailable, falling back to IMDSv1"
        );
        self.metrics.record_credential_fallback("aws");
    }

    fn with_headers(&self, mut request: RequestBuilder, source: &MetadataSource) -> RequestBuilder {
        for (name, value) in source.provider.fixed_headers() {
            request = request.header(*name, *value);
        }
        for (name, value) in &source.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request.timeout(source.timeout())
    }
}

fn transport_error(url: &str, error: &reqwest::Error) -> VaultkeeperError {
    VaultkeeperError::credential_source(KIND, format!("request to {} failed: {}", url, error))
}
