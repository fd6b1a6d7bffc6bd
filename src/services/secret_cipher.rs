//! Envelope encryption for secret payloads
//!
//! Each payload is sealed with a fresh AES-256-GCM data key; the data key is
//! wrapped by the KMS. Layout:
//!
//! ```text
//! body     = 0x01 | u16be(len(wrapped_key)) | wrapped_key | nonce(12) | ciphertext+tag
//! envelope = body | u32be(crc32c(body))
//! ```
//!
//! CRC32C is checked at every hop: the data key sent to and returned from the
//! KMS, the wrapped key returned by the KMS, and the envelope itself. A
//! checksum the KMS does not report counts as a violation.

use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use tracing::{debug, error, instrument};
use zeroize::Zeroizing;

use crate::errors::{Result, VaultkeeperError};
use crate::resilience::CallContext;
use crate::secrets::checksum::{crc32c, verify_reported};
use crate::secrets::{KmsClient, SecretBytes};

/// Envelope format version
pub const ENVELOPE_VERSION: u8 = 0x01;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const CRC_SIZE: usize = 4;
const HEADER_SIZE: usize = 1 + 2;

/// Single-use nonce sequence for AES-GCM
struct SingleNonce {
    nonce: Option<[u8; NONCE_SIZE]>,
}

impl SingleNonce {
    fn new(nonce_bytes: [u8; NONCE_SIZE]) -> Self {
        Self { nonce: Some(nonce_bytes) }
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.nonce.take().map(Nonce::assume_unique_for_key).ok_or(ring::error::Unspecified)
    }
}

/// Parsed view of an envelope body.
struct EnvelopeParts<'a> {
    wrapped_key: &'a [u8],
    nonce: [u8; NONCE_SIZE],
    ciphertext: &'a [u8],
}

fn parse_body(body: &[u8]) -> Result<EnvelopeParts<'_>> {
    let corrupted = |message: &str| VaultkeeperError::corrupted("decrypt", message);

    if body.len() < HEADER_SIZE {
        return Err(corrupted("envelope too short"));
    }
    if body[0] != ENVELOPE_VERSION {
        return Err(corrupted(&format!("unsupported envelope version {:#04x}", body[0])));
    }
    let wrapped_len = u16::from_be_bytes([body[1], body[2]]) as usize;
    let rest = &body[HEADER_SIZE..];
    if rest.len() < wrapped_len + NONCE_SIZE + TAG_SIZE {
        return Err(corrupted("envelope truncated"));
    }
    let (wrapped_key, rest) = rest.split_at(wrapped_len);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(nonce);
    Ok(EnvelopeParts { wrapped_key, nonce: nonce_bytes, ciphertext })
}

/// Stateless envelope cipher. Without a KMS every call fails with
/// `EncryptionUnavailable`; there is no plaintext fallback.
#[derive(Debug, Clone)]
pub struct SecretCipher {
    kms: Option<Arc<dyn KmsClient>>,
    key_name: Option<String>,
    rng: Arc<SystemRandom>,
}

impl SecretCipher {
    pub fn new(kms: Arc<dyn KmsClient>, key_name: impl Into<String>) -> Self {
        Self { kms: Some(kms), key_name: Some(key_name.into()), rng: Arc::new(SystemRandom::new()) }
    }

    /// A cipher with no KMS key configured.
    pub fn unconfigured() -> Self {
        Self { kms: None, key_name: None, rng: Arc::new(SystemRandom::new()) }
    }

    pub fn from_parts(kms: Option<Arc<dyn KmsClient>>, key_name: Option<String>) -> Self {
        match (kms, key_name) {
            (Some(kms), Some(key_name)) => Self::new(kms, key_name),
            _ => Self::unconfigured(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.kms.is_some() && self.key_name.is_some()
    }

    fn kms(&self, operation: &str) -> Result<(&dyn KmsClient, &str)> {
        match (&self.kms, &self.key_name) {
            (Some(kms), Some(key_name)) => Ok((kms.as_ref(), key_name.as_str())),
            _ => Err(VaultkeeperError::encryption_unavailable(operation)),
        }
    }

    fn random<const N: usize>(&self) -> Result<Zeroizing<[u8; N]>> {
        let mut bytes = Zeroizing::new([0u8; N]);
        self.rng.fill(bytes.as_mut()).map_err(|_| {
            error!("Failed to generate random bytes");
            VaultkeeperError::internal("Failed to generate random bytes for encryption")
        })?;
        Ok(bytes)
    }

    /// Seal `plaintext` into a self-describing envelope.
    #[instrument(skip(self, ctx, plaintext), fields(plaintext_len = plaintext.len()))]
    pub async fn encrypt(&self, ctx: &CallContext, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (kms, key_name) = self.kms("encrypt")?;

        let data_key = self.random::<KEY_SIZE>()?;
        let nonce = self.random::<NONCE_SIZE>()?;

        let unbound_key = UnboundKey::new(&AES_256_GCM, data_key.as_ref())
            .map_err(|_| VaultkeeperError::internal("Failed to create data key"))?;
        let mut sealing_key = aead::SealingKey::new(unbound_key, SingleNonce::new(*nonce));
        let mut ciphertext = plaintext.to_vec();
        ciphertext.reserve(TAG_SIZE);
        sealing_key
            .seal_in_place_append_tag(Aad::empty(), &mut ciphertext)
            .map_err(|_| VaultkeeperError::internal("Failed to encrypt secret data"))?;

        let key_crc = crc32c(data_key.as_ref());
        let wrapped = kms.encrypt(ctx, key_name, data_key.as_ref(), key_crc).await?;
        if !wrapped.verified_plaintext_crc32c {
            return Err(VaultkeeperError::integrity("kms_encrypt", key_name, Some(key_crc), None));
        }
        verify_reported("kms_encrypt", key_name, &wrapped.ciphertext, wrapped.ciphertext_crc32c)?;

        let wrapped_len = u16::try_from(wrapped.ciphertext.len())
            .map_err(|_| VaultkeeperError::internal("Wrapped data key too large for envelope"))?;

        let mut envelope = Vec::with_capacity(
            HEADER_SIZE + wrapped.ciphertext.len() + NONCE_SIZE + ciphertext.len() + CRC_SIZE,
        );
        envelope.push(ENVELOPE_VERSION);
        envelope.extend_from_slice(&wrapped_len.to_be_bytes());
        envelope.extend_from_slice(&wrapped.ciphertext);
        envelope.extend_from_slice(nonce.as_ref());
        envelope.extend_from_slice(&ciphertext);
        let body_crc = crc32c(&envelope);
        envelope.extend_from_slice(&body_crc.to_be_bytes());

        debug!(envelope_len = envelope.len(), "Sealed secret payload");
        Ok(envelope)
    }

    /// Open an envelope produced by [`SecretCipher::encrypt`].
    #[instrument(skip(self, ctx, envelope), fields(envelope_len = envelope.len()))]
    pub async fn decrypt(&self, ctx: &CallContext, envelope: &[u8]) -> Result<SecretBytes> {
        let (kms, key_name) = self.kms("decrypt")?;

        if envelope.len() < CRC_SIZE {
            return Err(VaultkeeperError::corrupted("decrypt", "envelope too short"));
        }
        let (body, trailer) = envelope.split_at(envelope.len() - CRC_SIZE);
        let stored = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = crc32c(body);
        if stored != computed {
            return Err(VaultkeeperError::integrity(
                "decrypt",
                "envelope",
                Some(computed),
                Some(stored),
            ));
        }

        let parts = parse_body(body)?;
        let unwrapped =
            kms.decrypt(ctx, key_name, parts.wrapped_key, crc32c(parts.wrapped_key)).await?;
        verify_reported(
            "kms_decrypt",
            key_name,
            unwrapped.plaintext.expose_secret(),
            unwrapped.plaintext_crc32c,
        )?;
        if unwrapped.plaintext.len() != KEY_SIZE {
            return Err(VaultkeeperError::corrupted("decrypt", "unwrapped data key has wrong size"));
        }

        let unbound_key = UnboundKey::new(&AES_256_GCM, unwrapped.plaintext.expose_secret())
            .map_err(|_| VaultkeeperError::internal("Failed to create data key"))?;
        let mut opening_key = aead::OpeningKey::new(unbound_key, SingleNonce::new(parts.nonce));
        let mut buffer = Zeroizing::new(parts.ciphertext.to_vec());
        let plaintext = opening_key
            .open_in_place(Aad::empty(), buffer.as_mut_slice())
            .map_err(|_| VaultkeeperError::corrupted("decrypt", "authentication tag mismatch"))?;

        Ok(SecretBytes::from(&*plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{ChecksumMode, MemoryKms};
    use proptest::prelude::*;

    const KEY: &str = "projects/p/locations/global/keyRings/r/cryptoKeys/k";

    fn cipher() -> (Arc<MemoryKms>, SecretCipher) {
        let kms = Arc::new(MemoryKms::new());
        (kms.clone(), SecretCipher::new(kms, KEY))
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (_, cipher) = cipher();
        let ctx = CallContext::new();
        let envelope = cipher.encrypt(&ctx, b"hunter2").await.unwrap();
        assert_eq!(envelope[0], ENVELOPE_VERSION);
        assert!(!envelope.windows(7).any(|w| w == b"hunter2"));
        let plaintext = cipher.decrypt(&ctx, &envelope).await.unwrap();
        assert_eq!(plaintext.expose_secret(), b"hunter2");
    }

    #[tokio::test]
    async fn test_empty_plaintext() {
        let (_, cipher) = cipher();
        let ctx = CallContext::new();
        let envelope = cipher.encrypt(&ctx, b"").await.unwrap();
        assert!(cipher.decrypt(&ctx, &envelope).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_fails_fast() {
        let cipher = SecretCipher::unconfigured();
        let ctx = CallContext::new();
        assert!(matches!(
            cipher.encrypt(&ctx, b"x").await.unwrap_err(),
            VaultkeeperError::EncryptionUnavailable { .. }
        ));
        assert!(matches!(
            cipher.decrypt(&ctx, b"x").await.unwrap_err(),
            VaultkeeperError::EncryptionUnavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_corruption_detected_before_kms_call() {
        let (kms, cipher) = cipher();
        let ctx = CallContext::new();
        let mut envelope = cipher.encrypt(&ctx, b"payload").await.unwrap();
        let calls = kms.call_count();
        let middle = envelope.len() / 2;
        envelope[middle] ^= 0x01;

        let err = cipher.decrypt(&ctx, &envelope).await.unwrap_err();
        assert!(matches!(err, VaultkeeperError::IntegrityViolation { .. }));
        assert_eq!(kms.call_count(), calls);
    }

    #[tokio::test]
    async fn test_missing_kms_checksum_is_violation() {
        let (kms, cipher) = cipher();
        let ctx = CallContext::new();
        let envelope = cipher.encrypt(&ctx, b"payload").await.unwrap();

        kms.set_checksum_mode(ChecksumMode::Missing);
        assert!(cipher.encrypt(&ctx, b"payload").await.unwrap_err().is_integrity_violation());
        assert!(cipher.decrypt(&ctx, &envelope).await.unwrap_err().is_integrity_violation());
    }

    #[tokio::test]
    async fn test_wrong_kms_checksum_is_violation() {
        let (kms, cipher) = cipher();
        kms.set_checksum_mode(ChecksumMode::Wrong);
        let err = cipher.encrypt(&CallContext::new(), b"payload").await.unwrap_err();
        assert!(matches!(err, VaultkeeperError::IntegrityViolation { .. }));
    }

    #[tokio::test]
    async fn test_unknown_version_rejected() {
        let (_, cipher) = cipher();
        let mut body = vec![0x02, 0, 0];
        body.extend_from_slice(&[0u8; NONCE_SIZE + TAG_SIZE]);
        let crc = crc32c(&body);
        body.extend_from_slice(&crc.to_be_bytes());
        let err = cipher.decrypt(&CallContext::new(), &body).await.unwrap_err();
        assert!(matches!(err, VaultkeeperError::CorruptedEnvelope { .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_round_trip(plaintext in proptest::collection::vec(any::<u8>(), 0..512)) {
            let (_, cipher) = cipher();
            let ctx = CallContext::new();
            let decrypted = tokio_test::block_on(async {
                let envelope = cipher.encrypt(&ctx, &plaintext).await?;
                cipher.decrypt(&ctx, &envelope).await
            }).unwrap();
            prop_assert_eq!(decrypted.expose_secret(), plaintext.as_slice());
        }

        #[test]
        fn prop_any_corrupted_byte_fails(
            plaintext in proptest::collection::vec(any::<u8>(), 1..128),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let (_, cipher) = cipher();
            let ctx = CallContext::new();
            let err = tokio_test::block_on(async {
                let mut envelope = cipher.encrypt(&ctx, &plaintext).await?;
                let i = index.index(envelope.len());
                envelope[i] ^= flip;
                cipher.decrypt(&ctx, &envelope).await
            }).unwrap_err();
            prop_assert!(err.is_integrity_violation());
        }
    }
}
