use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use super::{deserialize_crc, join_segments, parse_base, RestTransport};
use crate::domain::{
    annotations, is_valid_secret_name, BackupPolicy, EncryptionConfig, ReplicationMode,
    RotationPolicy, Secret, SecretType, SecretVersion, VersionSelector, VersionState,
};
use crate::errors::{Result, VaultkeeperError};
use crate::resilience::CallContext;
use crate::secrets::backends::backend::SecretStore;
use crate::secrets::checksum::crc32c;

const PAGE_SIZE: &str = "100";
const DEFAULT_BACKUP_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretResource {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    topics: Vec<TopicResource>,
    rotation: Option<RotationResource>,
    replication: Option<ReplicationResource>,
    customer_managed_encryption: Option<CmekResource>,
    create_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TopicResource {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RotationResource {
    rotation_period: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplicationResource {
    automatic: Option<AutomaticReplication>,
    user_managed: Option<UserManagedReplication>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutomaticReplication {
    customer_managed_encryption: Option<CmekResource>,
}

#[derive(Debug, Deserialize)]
struct UserManagedReplication {
    #[serde(default)]
    replicas: Vec<ReplicaResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplicaResource {
    location: String,
    customer_managed_encryption: Option<CmekResource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CmekResource {
    kms_key_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListSecretsResponse {
    #[serde(default)]
    secrets: Vec<SecretResource>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionResource {
    name: String,
    create_time: Option<DateTime<Utc>>,
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListVersionsResponse {
    #[serde(default)]
    versions: Vec<VersionResource>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccessResponse {
    name: String,
    payload: PayloadResource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadResource {
    #[serde(default)]
    data: String,
    #[serde(default, deserialize_with = "deserialize_crc")]
    data_crc32c: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct IamPolicy {
    #[serde(default)]
    bindings: Vec<IamBinding>,
}

#[derive(Debug, Deserialize)]
struct IamBinding {
    #[serde(default)]
    members: Vec<String>,
}

/// Secret Manager v1 REST client.
#[derive(Debug, Clone)]
pub struct GcpSecretManager {
    transport: RestTransport,
    base: Url,
    project: String,
    filter: Option<String>,
}

impl GcpSecretManager {
    pub(crate) fn new(transport: RestTransport, base: &str, project: &str) -> Result<Self> {
        Ok(Self {
            transport,
            base: parse_base(base)?,
            project: project.to_string(),
            filter: None,
        })
    }

    /// Restrict `list_secrets` with a Secret Manager filter expression.
    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    fn secret_path(&self, name: &str) -> Result<String> {
        if !is_valid_secret_name(name) {
            return Err(VaultkeeperError::validation_field(
                format!("Invalid secret name '{}'", name),
                "name",
            ));
        }
        Ok(format!("projects/{}/secrets/{}", self.project, name))
    }

    /// `v1/{path}` with an optional `:action` suffix on the last segment.
    fn url(&self, path: &str, action: Option<&str>) -> Result<Url> {
        let mut segments: Vec<String> = path.split('/').map(str::to_string).collect();
        if let (Some(action), Some(last)) = (action, segments.last_mut()) {
            last.push(':');
            last.push_str(action);
        }
        join_segments(&self.base, std::iter::once("v1").chain(segments.iter().map(String::as_str)))
    }

    fn check_version_id(version_id: &str) -> Result<()> {
        let valid = version_id.starts_with("projects/")
            && version_id
                .rsplit_once("/versions/")
                .is_some_and(|(_, n)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        if !valid {
            return Err(VaultkeeperError::validation_field(
                format!("Malformed version id '{}'", version_id),
                "version_id",
            ));
        }
        Ok(())
    }

    async fn fetch_secret_resource(
        &self,
        ctx: &CallContext,
        path: &str,
    ) -> Result<SecretResource> {
        let request = self.transport.http().get(self.url(path, None)?);
        self.transport.json(ctx, "get_secret", path, request).await
    }

    async fn access_members(&self, ctx: &CallContext, path: &str) -> Result<Vec<String>> {
        let request = self.transport.http().get(self.url(path, Some("getIamPolicy"))?);
        let policy: IamPolicy = self.transport.json(ctx, "get_iam_policy", path, request).await?;
        let members: BTreeSet<String> =
            policy.bindings.into_iter().flat_map(|b| b.members).collect();
        Ok(members.into_iter().collect())
    }

    async fn set_version_state(
        &self,
        ctx: &CallContext,
        operation: &str,
        action: &str,
        version_id: &str,
    ) -> Result<()> {
        Self::check_version_id(version_id)?;
        let url = self.url(version_id, Some(action))?;
        let request = self.transport.http().post(url).json(&json!({}));
        let _: VersionResource = self.transport.json(ctx, operation, version_id, request).await?;
        debug!(version = %version_id, action = %action, "Changed version state");
        Ok(())
    }
}

#[async_trait]
impl SecretStore for GcpSecretManager {
    #[instrument(skip(self, ctx), fields(project = %self.project))]
    async fn get_secret(&self, ctx: &CallContext, name: &str) -> Result<Secret> {
        let path = self.secret_path(name)?;
        let resource = self.fetch_secret_resource(ctx, &path).await?;
        let mut secret = secret_from_resource(resource)?;
        secret.access_members = self.access_members(ctx, &path).await?;
        Ok(secret)
    }

    /// IAM members are not fetched here; use `get_secret` for those.
    async fn list_secrets(&self, ctx: &CallContext) -> Result<Vec<Secret>> {
        let parent = format!("projects/{}", self.project);
        let mut secrets = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = join_segments(&self.base, ["v1", "projects", &self.project, "secrets"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("pageSize", PAGE_SIZE);
                if let Some(filter) = &self.filter {
                    query.append_pair("filter", filter);
                }
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let request = self.transport.http().get(url);
            let page: ListSecretsResponse =
                self.transport.json(ctx, "list_secrets", &parent, request).await?;
            for resource in page.secrets {
                secrets.push(secret_from_resource(resource)?);
            }
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(secrets)
    }

    async fn access_version(
        &self,
        ctx: &CallContext,
        name: &str,
        selector: &VersionSelector,
    ) -> Result<SecretVersion> {
        let path =
            format!("{}/versions/{}", self.secret_path(name)?, selector.as_path_segment());
        let request = self.transport.http().get(self.url(&path, Some("access"))?);
        let response: AccessResponse =
            self.transport.json(ctx, "access_version", &path, request).await?;

        let payload = STANDARD.decode(response.payload.data.as_bytes()).map_err(|e| {
            VaultkeeperError::backend(
                "access_version",
                &path,
                format!("payload is not valid base64: {}", e),
                false,
            )
        })?;
        let checksum = response.payload.data_crc32c.ok_or_else(|| {
            VaultkeeperError::integrity("access_version", &path, Some(crc32c(&payload)), None)
        })?;

        // The access response carries no timestamps; read them from the version itself.
        let request = self.transport.http().get(self.url(&response.name, None)?);
        let meta: VersionResource =
            self.transport.json(ctx, "get_version", &response.name, request).await?;

        Ok(SecretVersion {
            id: response.name,
            secret_name: name.to_string(),
            payload_ciphertext: payload,
            checksum,
            state: parse_state(meta.state.as_deref()),
            created_at: meta.create_time.unwrap_or_else(Utc::now),
        })
    }

    async fn add_version(
        &self,
        ctx: &CallContext,
        name: &str,
        payload: &[u8],
    ) -> Result<SecretVersion> {
        let path = self.secret_path(name)?;
        let checksum = crc32c(payload);
        let body = json!({
            "payload": {
                "data": STANDARD.encode(payload),
                "dataCrc32c": checksum.to_string(),
            }
        });
        let request = self.transport.http().post(self.url(&path, Some("addVersion"))?).json(&body);
        let created: VersionResource =
            self.transport.json(ctx, "add_version", &path, request).await?;

        Ok(SecretVersion {
            id: created.name,
            secret_name: name.to_string(),
            payload_ciphertext: payload.to_vec(),
            checksum,
            state: parse_state(created.state.as_deref()),
            created_at: created.create_time.unwrap_or_else(Utc::now),
        })
    }

    async fn disable_version(&self, ctx: &CallContext, version_id: &str) -> Result<()> {
        self.set_version_state(ctx, "disable_version", "disable", version_id).await
    }

    async fn enable_version(&self, ctx: &CallContext, version_id: &str) -> Result<()> {
        self.set_version_state(ctx, "enable_version", "enable", version_id).await
    }

    async fn list_versions(&self, ctx: &CallContext, name: &str) -> Result<Vec<SecretVersion>> {
        let path = self.secret_path(name)?;
        let mut versions = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.url(&format!("{}/versions", path), None)?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("pageSize", PAGE_SIZE);
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let request = self.transport.http().get(url);
            let page: ListVersionsResponse =
                self.transport.json(ctx, "list_versions", &path, request).await?;
            versions.extend(page.versions.into_iter().map(|v| SecretVersion {
                id: v.name,
                secret_name: name.to_string(),
                payload_ciphertext: Vec::new(),
                checksum: 0,
                state: parse_state(v.state.as_deref()),
                created_at: v.create_time.unwrap_or(DateTime::<Utc>::MIN_UTC),
            }));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        versions.sort_by(|a, b| b.number().cmp(&a.number()));
        Ok(versions)
    }

    async fn record_rotation(
        &self,
        ctx: &CallContext,
        name: &str,
        rotated_at: DateTime<Utc>,
    ) -> Result<()> {
        let path = self.secret_path(name)?;
        let mut current = self.fetch_secret_resource(ctx, &path).await?.annotations;
        current.insert(annotations::LAST_ROTATED_AT.to_string(), rotated_at.to_rfc3339());

        let mut url = self.url(&path, None)?;
        url.query_pairs_mut().append_pair("updateMask", "annotations");
        let request = self.transport.http().patch(url).json(&json!({ "annotations": current }));
        let _: serde_json::Value =
            self.transport.json(ctx, "record_rotation", &path, request).await?;
        Ok(())
    }
}

fn parse_state(state: Option<&str>) -> VersionState {
    match state {
        Some("ENABLED") => VersionState::Enabled,
        Some("DESTROYED") => VersionState::Destroyed,
        _ => VersionState::Disabled,
    }
}

/// Parse a protobuf JSON duration such as `"86400s"` or `"1.5s"`.
fn parse_proto_duration(value: &str) -> Option<Duration> {
    let seconds: f64 = value.strip_suffix('s')?.parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

fn secret_from_resource(resource: SecretResource) -> Result<Secret> {
    let name = resource.name.rsplit('/').next().unwrap_or_default().to_string();
    let mut secret = Secret::new(name, resource.name.clone());
    secret.secret_type = SecretType::from_labels(&resource.labels);
    secret.created_at = resource.create_time;

    let last_rotated_at = resource
        .annotations
        .get(annotations::LAST_ROTATED_AT)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc));
    secret.rotation_policy = resource
        .rotation
        .and_then(|r| r.rotation_period)
        .and_then(|p| parse_proto_duration(&p))
        .map(|period| RotationPolicy { period, last_rotated_at });

    let mut kms_key = resource.customer_managed_encryption.map(|c| c.kms_key_name);
    secret.replication = match resource.replication {
        Some(ReplicationResource { automatic: Some(auto), .. }) => {
            kms_key = kms_key.or(auto.customer_managed_encryption.map(|c| c.kms_key_name));
            ReplicationMode::Automatic
        }
        Some(ReplicationResource { user_managed: Some(user), .. }) => {
            kms_key = kms_key.or_else(|| {
                user.replicas
                    .iter()
                    .find_map(|r| r.customer_managed_encryption.clone())
                    .map(|c| c.kms_key_name)
            });
            ReplicationMode::UserManaged {
                locations: user.replicas.into_iter().map(|r| r.location).collect(),
            }
        }
        _ => ReplicationMode::Unspecified,
    };
    secret.encryption = kms_key.map(|kms_key_name| EncryptionConfig { kms_key_name });

    secret.audit_log_destination = resource
        .topics
        .into_iter()
        .map(|t| t.name)
        .next()
        .or_else(|| resource.annotations.get(annotations::AUDIT_LOG).cloned());

    if let Some(raw) = resource.annotations.get(annotations::BACKUP_INTERVAL_HOURS) {
        let hours: u64 = raw.parse().map_err(|_| {
            VaultkeeperError::validation_field(
                format!("Invalid backup interval '{}' on {}", raw, resource.name),
                annotations::BACKUP_INTERVAL_HOURS,
            )
        })?;
        let retention_days = resource
            .annotations
            .get(annotations::BACKUP_RETENTION_DAYS)
            .and_then(|d| d.parse().ok())
            .unwrap_or(DEFAULT_BACKUP_RETENTION_DAYS);
        secret.backup_policy = Some(BackupPolicy {
            interval: Duration::from_secs(hours * 3600),
            retention_days,
        });
    }

    secret.labels = resource.labels;
    secret.annotations = resource.annotations;
    Ok(secret)
}
