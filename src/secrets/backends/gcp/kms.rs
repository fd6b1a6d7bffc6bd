use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::{deserialize_crc, join_segments, parse_base, RestTransport};
use crate::errors::{Result, VaultkeeperError};
use crate::resilience::CallContext;
use crate::secrets::backends::backend::{KmsClient, KmsDecryptResponse, KmsEncryptResponse};
use crate::secrets::SecretBytes;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptResponse {
    ciphertext: String,
    #[serde(default, deserialize_with = "deserialize_crc")]
    ciphertext_crc32c: Option<u32>,
    #[serde(default)]
    verified_plaintext_crc32c: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecryptResponse {
    plaintext: String,
    #[serde(default, deserialize_with = "deserialize_crc")]
    plaintext_crc32c: Option<u32>,
}

/// Cloud KMS v1 REST client. Checksums are passed through unverified;
/// the secret cipher decides what a missing or wrong checksum means.
#[derive(Debug, Clone)]
pub struct GcpKms {
    transport: RestTransport,
    base: Url,
}

impl GcpKms {
    pub(crate) fn new(transport: RestTransport, base: &str) -> Result<Self> {
        Ok(Self { transport, base: parse_base(base)? })
    }

    fn url(&self, key_name: &str, action: &str) -> Result<Url> {
        if !key_name.starts_with("projects/") || key_name.contains("..") {
            return Err(VaultkeeperError::validation_field(
                format!("Invalid KMS key name '{}'", key_name),
                "kms.key_name",
            ));
        }
        let mut segments: Vec<String> = key_name.split('/').map(str::to_string).collect();
        if let Some(last) = segments.last_mut() {
            last.push(':');
            last.push_str(action);
        }
        join_segments(&self.base, std::iter::once("v1").chain(segments.iter().map(String::as_str)))
    }

    fn decode(operation: &str, key_name: &str, field: &str, value: &str) -> Result<Vec<u8>> {
        STANDARD.decode(value.as_bytes()).map_err(|e| {
            VaultkeeperError::backend(
                operation,
                key_name,
                format!("{} is not valid base64: {}", field, e),
                false,
            )
        })
    }
}

#[async_trait]
impl KmsClient for GcpKms {
    async fn encrypt(
        &self,
        ctx: &CallContext,
        key_name: &str,
        plaintext: &[u8],
        plaintext_crc32c: u32,
    ) -> Result<KmsEncryptResponse> {
        let body = json!({
            "plaintext": STANDARD.encode(plaintext),
            "plaintextCrc32c": plaintext_crc32c.to_string(),
        });
        let request = self.transport.http().post(self.url(key_name, "encrypt")?).json(&body);
        let response: EncryptResponse =
            self.transport.json(ctx, "kms_encrypt", key_name, request).await?;

        Ok(KmsEncryptResponse {
            ciphertext: Self::decode("kms_encrypt", key_name, "ciphertext", &response.ciphertext)?,
            ciphertext_crc32c: response.ciphertext_crc32c,
            verified_plaintext_crc32c: response.verified_plaintext_crc32c,
        })
    }

    async fn decrypt(
        &self,
        ctx: &CallContext,
        key_name: &str,
        ciphertext: &[u8],
        ciphertext_crc32c: u32,
    ) -> Result<KmsDecryptResponse> {
        let body = json!({
            "ciphertext": STANDARD.encode(ciphertext),
            "ciphertextCrc32c": ciphertext_crc32c.to_string(),
        });
        let request = self.transport.http().post(self.url(key_name, "decrypt")?).json(&body);
        let response: DecryptResponse =
            self.transport.json(ctx, "kms_decrypt", key_name, request).await?;

        Ok(KmsDecryptResponse {
            plaintext: SecretBytes::new(Self::decode(
                "kms_decrypt",
                key_name,
                "plaintext",
                &response.plaintext,
            )?),
            plaintext_crc32c: response.plaintext_crc32c,
        })
    }
}
