//! CRC32C (Castagnoli) integrity checksums.
//!
//! Used to detect corruption of payloads in transit and at rest. This is not
//! an authenticity check; the AEAD tag covers that.

use crate::errors::{Result, VaultkeeperError};

/// CRC32C of `data`.
pub fn crc32c(data: &[u8]) -> u32 {
    ::crc32c::crc32c(data)
}

/// Verify that a backend-reported checksum matches `data`.
///
/// A missing checksum means the integrity of the response cannot be
/// established and is reported as a violation, never as success.
pub fn verify_reported(
    operation: &str,
    resource: &str,
    data: &[u8],
    reported: Option<u32>,
) -> Result<()> {
    let computed = crc32c(data);
    match reported {
        Some(value) if value == computed => Ok(()),
        other => Err(VaultkeeperError::integrity(operation, resource, Some(computed), other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reference_vectors() {
        assert_eq!(crc32c(b""), 0x0000_0000);
        assert_eq!(crc32c(b"123456789"), 0xE306_9283);
        assert_eq!(crc32c(&[0u8; 32]), 0x8A91_36AA);
        assert_eq!(crc32c(&[0xFFu8; 32]), 0x62A8_AB43);
    }

    #[test]
    fn test_verify_reported() {
        let data = b"payload";
        assert!(verify_reported("op", "r", data, Some(crc32c(data))).is_ok());

        let err = verify_reported("op", "r", data, Some(crc32c(data) ^ 1)).unwrap_err();
        assert!(matches!(err, VaultkeeperError::IntegrityViolation { .. }));

        let err = verify_reported("op", "r", data, None).unwrap_err();
        assert!(matches!(err, VaultkeeperError::IntegrityViolation { actual: None, .. }));
    }

    proptest! {
        #[test]
        fn prop_checksum_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            prop_assert_eq!(crc32c(&data), crc32c(&data.clone()));
        }

        #[test]
        fn prop_single_byte_flip_changes_checksum(
            data in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut corrupted = data.clone();
            let i = index.index(corrupted.len());
            corrupted[i] ^= flip;
            prop_assert_ne!(crc32c(&data), crc32c(&corrupted));
        }
    }
}
