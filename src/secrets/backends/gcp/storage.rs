use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{join_segments, parse_base, RestTransport};
use crate::errors::{Result, VaultkeeperError};
use crate::resilience::CallContext;
use crate::secrets::backends::backend::ObjectStore;
use crate::secrets::checksum::crc32c;

#[derive(Debug, Deserialize)]
struct ObjectResource {
    /// Base64 of the big-endian CRC32C
    crc32c: Option<String>,
}

/// Cloud Storage JSON API client. Uploads and downloads are checked against
/// the CRC32C that GCS reports for the object.
#[derive(Debug, Clone)]
pub struct GcsObjectStore {
    transport: RestTransport,
    base: Url,
}

impl GcsObjectStore {
    pub(crate) fn new(transport: RestTransport, base: &str) -> Result<Self> {
        Ok(Self { transport, base: parse_base(base)? })
    }
}

fn decode_gcs_crc(encoded: &str) -> Option<u32> {
    let bytes = STANDARD.decode(encoded.trim()).ok()?;
    let bytes: [u8; 4] = bytes.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Extract `crc32c=...` from an `x-goog-hash` header value.
fn crc_from_hash_header(value: &str) -> Option<u32> {
    value.split(',').find_map(|part| part.trim().strip_prefix("crc32c=")).and_then(decode_gcs_crc)
}

fn check(operation: &str, object: &str, data: &[u8], reported: Option<u32>) -> Result<()> {
    match reported {
        Some(reported) if reported != crc32c(data) => Err(VaultkeeperError::integrity(
            operation,
            object,
            Some(crc32c(data)),
            Some(reported),
        )),
        _ => Ok(()),
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn put_object(
        &self,
        ctx: &CallContext,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let object = format!("gs://{}/{}", bucket, key);
        let mut url = join_segments(&self.base, ["upload", "storage", "v1", "b", bucket, "o"])?;
        url.query_pairs_mut().append_pair("uploadType", "media").append_pair("name", key);

        let expected = crc32c(&bytes);
        let request = self
            .transport
            .http()
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes);
        let created: ObjectResource =
            self.transport.json(ctx, "put_object", &object, request).await?;

        if let Some(reported) = created.crc32c.as_deref().and_then(decode_gcs_crc) {
            if reported != expected {
                return Err(VaultkeeperError::integrity(
                    "put_object",
                    &object,
                    Some(expected),
                    Some(reported),
                ));
            }
        }
        debug!(object = %object, "Uploaded object");
        Ok(())
    }

    async fn get_object(&self, ctx: &CallContext, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let object = format!("gs://{}/{}", bucket, key);
        let mut url = join_segments(&self.base, ["storage", "v1", "b", bucket, "o", key])?;
        url.query_pairs_mut().append_pair("alt", "media");

        let request = self.transport.http().get(url);
        let response = self.transport.send(ctx, "get_object", &object, request).await?;
        let reported = response
            .headers()
            .get_all("x-goog-hash")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(crc_from_hash_header);

        let bytes = ctx
            .run("get_object", async {
                response
                    .bytes()
                    .await
                    .map_err(|e| VaultkeeperError::from_reqwest("get_object", &object, &e))
            })
            .await?
            .to_vec();

        check("get_object", &object, &bytes, reported)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::transport;
    use super::*;
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gcs_crc(data: &[u8]) -> String {
        STANDARD.encode(crc32c(data).to_be_bytes())
    }

    #[tokio::test]
    async fn test_upload_verifies_reported_crc() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/backups/o"))
            .and(query_param("name", "secrets/api-key/1.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "secrets/api-key/1.json",
                "crc32c": gcs_crc(b"{}")
            })))
            .mount(&server)
            .await;

        let gcs = GcsObjectStore::new(transport(), &server.uri()).unwrap();
        let ctx = CallContext::new();
        gcs.put_object(&ctx, "backups", "secrets/api-key/1.json", b"{}".to_vec()).await.unwrap();

        let err = gcs
            .put_object(&ctx, "backups", "secrets/api-key/1.json", b"{ }".to_vec())
            .await
            .unwrap_err();
        assert!(err.is_integrity_violation());
    }

    #[tokio::test]
    async fn test_download_checks_hash_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/storage/v1/b/backups/o/.+$"))
            .and(query_param("alt", "media"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-goog-hash", format!("crc32c={},md5=abc", gcs_crc(b"other")))
                    .set_body_bytes(b"payload".to_vec()),
            )
            .mount(&server)
            .await;

        let gcs = GcsObjectStore::new(transport(), &server.uri()).unwrap();
        let err = gcs.get_object(&CallContext::new(), "backups", "a/b.json").await.unwrap_err();
        assert!(err.is_integrity_violation());
    }

    #[test]
    fn test_crc_from_hash_header() {
        let header = format!("crc32c={}, md5=1B2M2Y8AsgTpgAmY7PhCfg==", gcs_crc(b"123456789"));
        assert_eq!(crc_from_hash_header(&header), Some(0xE306_9283));
        assert_eq!(crc_from_hash_header("md5=abc"), None);
    }
}
