//! Credential source configuration.
//!
//! The source is a closed sum type; every resolver match is exhaustive so an
//! unrecognised source cannot silently produce nothing. Sources are usually
//! deserialized from the `[credentials.source]` table:
//!
//! ```toml
//! [credentials.source]
//! type = "metadata_service"
//! provider = "aws"
//! timeout_millis = 2000
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::domain::CredentialSourceKind;
use crate::errors::{Result, VaultkeeperError};
use crate::secrets::SecretString;

/// Metadata endpoints are link-local; anything slower than this is broken.
pub const MAX_METADATA_TIMEOUT: Duration = Duration::from_secs(10);

fn default_executable_timeout_millis() -> u64 {
    30_000
}

fn default_metadata_timeout_millis() -> u64 {
    2_000
}

fn default_session_ttl_seconds() -> u64 {
    21_600
}

fn default_token_ttl_seconds() -> u64 {
    3_600
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSource {
    Static(StaticSource),
    Executable(ExecutableSource),
    MetadataService(MetadataSource),
}

impl CredentialSource {
    pub fn kind(&self) -> CredentialSourceKind {
        match self {
            Self::Static(_) => CredentialSourceKind::Static,
            Self::Executable(_) => CredentialSourceKind::Executable,
            Self::MetadataService(_) => CredentialSourceKind::MetadataService,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Static(source) => {
                if source.token.is_empty() {
                    return Err(VaultkeeperError::validation_field(
                        "Static credential token cannot be empty",
                        "credentials.source.token",
                    ));
                }
            }
            Self::Executable(source) => {
                if source.command.trim().is_empty() {
                    return Err(VaultkeeperError::validation_field(
                        "Executable credential command cannot be empty",
                        "credentials.source.command",
                    ));
                }
                if source.timeout_millis == 0 {
                    return Err(VaultkeeperError::validation_field(
                        "Executable timeout must be positive",
                        "credentials.source.timeout_millis",
                    ));
                }
            }
            Self::MetadataService(source) => {
                if source.timeout_millis == 0 || source.timeout() > MAX_METADATA_TIMEOUT {
                    return Err(VaultkeeperError::validation_field(
                        format!(
                            "Metadata timeout must be between 1 and {} ms",
                            MAX_METADATA_TIMEOUT.as_millis()
                        ),
                        "credentials.source.timeout_millis",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A preconfigured token with a fixed expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticSource {
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

/// How to interpret stdout or a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

/// An external program that prints a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableSource {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment passed to the child
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_executable_timeout_millis")]
    pub timeout_millis: u64,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// JSON field holding the token; the common names are tried as well
    #[serde(default)]
    pub token_field: Option<String>,
    /// Lifetime assumed when the output carries no expiry
    #[serde(default = "default_token_ttl_seconds")]
    pub default_ttl_seconds: u64,
}

impl ExecutableSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout_millis: default_executable_timeout_millis(),
            output_format: OutputFormat::Json,
            token_field: None,
            default_ttl_seconds: default_token_ttl_seconds(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataProvider {
    /// EC2 instance metadata (IMDSv2 with explicit IMDSv1 fallback)
    Aws,
    /// Azure instance metadata, `Metadata: true`
    Azure,
    /// GCE metadata server, `Metadata-Flavor: Google`
    Gcp,
}

impl MetadataProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            Self::Aws | Self::Azure => "http://169.254.169.254",
            Self::Gcp => "http://metadata.google.internal",
        }
    }

    pub fn default_path(&self) -> &'static str {
        match self {
            Self::Aws => {
                "/latest/meta-data/identity-credentials/ec2/security-credentials/ec2-instance"
            }
            Self::Azure => {
                "/metadata/identity/oauth2/token?api-version=2018-02-01&resource=https%3A%2F%2Fmanagement.azure.com%2F"
            }
            Self::Gcp => "/computeMetadata/v1/instance/service-accounts/default/token",
        }
    }

    /// Headers every request to this provider must carry.
    pub fn fixed_headers(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Aws => &[],
            Self::Azure => &[("Metadata", "true")],
            Self::Gcp => &[("Metadata-Flavor", "Google")],
        }
    }
}

impl fmt::Display for MetadataProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A cloud instance-metadata endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataSource {
    pub provider: MetadataProvider,
    /// Base URL override, e.g. for a local emulator
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Token path override
    #[serde(default)]
    pub path: Option<String>,
    /// Additional request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_metadata_timeout_millis")]
    pub timeout_millis: u64,
    /// TTL requested for the IMDSv2 session token
    #[serde(default = "default_session_ttl_seconds")]
    pub session_ttl_seconds: u64,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub token_field: Option<String>,
    #[serde(default = "default_token_ttl_seconds")]
    pub default_ttl_seconds: u64,
}

impl MetadataSource {
    pub fn new(provider: MetadataProvider) -> Self {
        Self {
            provider,
            endpoint: None,
            path: None,
            headers: BTreeMap::new(),
            timeout_millis: default_metadata_timeout_millis(),
            session_ttl_seconds: default_session_ttl_seconds(),
            output_format: OutputFormat::Json,
            token_field: None,
            default_ttl_seconds: default_token_ttl_seconds(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn base_url(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(self.provider.default_endpoint()).trim_end_matches('/')
    }

    pub fn token_url(&self) -> String {
        let path = self.path.as_deref().unwrap_or(self.provider.default_path());
        format!("{}{}", self.base_url(), path)
    }

    /// Timeout for each request, capped at [`MAX_METADATA_TIMEOUT`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis).min(MAX_METADATA_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_tagged_sources() {
        let exec: CredentialSource = toml::from_str(
            r#"
            type = "executable"
            command = "/usr/local/bin/get-token"
            args = ["--audience", "vault"]
            output_format = "text"
            "#,
        )
        .unwrap();
        assert_eq!(exec.kind(), CredentialSourceKind::Executable);
        if let CredentialSource::Executable(source) = &exec {
            assert_eq!(source.timeout(), Duration::from_secs(30));
            assert_eq!(source.output_format, OutputFormat::Text);
        }

        let metadata: CredentialSource = serde_json::from_value(serde_json::json!({
            "type": "metadata_service",
            "provider": "azure",
        }))
        .unwrap();
        assert_eq!(metadata.kind(), CredentialSourceKind::MetadataService);
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn test_unknown_source_type_rejected() {
        let result: std::result::Result<CredentialSource, _> =
            serde_json::from_value(serde_json::json!({ "type": "file", "path": "/tmp/x" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_metadata_timeout_bounded() {
        let mut source = MetadataSource::new(MetadataProvider::Gcp);
        source.timeout_millis = 30_000;
        assert_eq!(source.timeout(), MAX_METADATA_TIMEOUT);
        assert!(CredentialSource::MetadataService(source).validate().is_err());
    }

    #[test]
    fn test_token_url_uses_override() {
        let source =
            MetadataSource::new(MetadataProvider::Gcp).with_endpoint("http://127.0.0.1:9/");
        assert_eq!(
            source.token_url(),
            "http://127.0.0.1:9/computeMetadata/v1/instance/service-accounts/default/token"
        );
    }

    #[test]
    fn test_empty_static_token_invalid() {
        let source = CredentialSource::Static(StaticSource {
            token: SecretString::new(""),
            expires_at: Utc::now(),
        });
        assert!(source.validate().is_err());
    }
}
