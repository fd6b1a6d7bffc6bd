//! # Resilience
//!
//! Cancellation, retries with backoff, client-side rate limiting and response
//! caching, applied uniformly to every backend call. Payload reads can also be
//! gated by per-secret access policies.

pub mod access_guard;
pub mod cache;
pub mod cached_store;
pub mod context;
pub mod gateway;
pub mod rate_limit;
pub mod retry;

pub use access_guard::AccessGuard;
pub use cache::{CacheEntry, ResponseCache};
pub use cached_store::CachedSecretStore;
pub use context::CallContext;
pub use gateway::{BackendGateway, ResilientKms, ResilientObjectStore, ResilientSecretStore};
pub use rate_limit::RateLimiter;
pub use retry::{RetryExecutor, RetryPolicy};
