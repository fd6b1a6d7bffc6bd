//! # Secrets
//!
//! Backend access for secrets, keys and backup objects, plus the redacting
//! value types and the CRC32C helpers used for integrity checks.
//!
//! ```rust,ignore
//! use vaultkeeper::resilience::CallContext;
//! use vaultkeeper::secrets::{MemorySecretStore, SecretStore};
//!
//! let store = MemorySecretStore::new("local");
//! let version = store.add_version(&CallContext::new(), "api-key", b"value").await?;
//! ```

pub mod backends;
pub mod checksum;
pub mod types;

pub use backends::{
    ChecksumMode, GcpBackends, GcpKms, GcpSecretManager, GcsObjectStore, KmsClient,
    KmsDecryptResponse, KmsEncryptResponse, MemoryKms, MemoryObjectStore, MemorySecretStore,
    ObjectStore, SecretStore,
};
pub use types::{SecretBytes, SecretString};
