//! Backend implementations behind the [`SecretStore`], [`KmsClient`] and
//! [`ObjectStore`] traits: Google Cloud over REST, and in-memory versions for
//! local runs and tests.

pub mod backend;
pub mod gcp;
pub mod memory;

pub use backend::{KmsClient, KmsDecryptResponse, KmsEncryptResponse, ObjectStore, SecretStore};
pub use gcp::{GcpBackends, GcpKms, GcpSecretManager, GcsObjectStore};
pub use memory::{ChecksumMode, MemoryKms, MemoryObjectStore, MemorySecretStore};
