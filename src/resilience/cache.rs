//! TTL cache for read-only backend results
//!
//! Entries expire lazily: a `get` that finds an expired entry evicts it and
//! reports a miss. There is no background sweeper. The cache is advisory;
//! callers can always go to the backend directly and mutating calls are
//! never cached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::observability::MetricsRecorder;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub cached_at: Instant,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Map-level read/write lock; no I/O happens while it is held.
#[derive(Debug)]
pub struct ResponseCache<V> {
    name: &'static str,
    entries: Arc<RwLock<HashMap<String, CacheEntry<V>>>>,
    default_ttl: Duration,
    metrics: MetricsRecorder,
}

impl<V: Clone + Send + Sync> ResponseCache<V> {
    pub fn new(name: &'static str, default_ttl: Duration, metrics: MetricsRecorder) -> Self {
        Self { name, entries: Arc::new(RwLock::new(HashMap::new())), default_ttl, metrics }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up `key`, evicting it if it has expired.
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    debug!(cache = self.name, key = %key, "Cache hit");
                    self.metrics.record_cache_lookup(self.name, true);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.metrics.record_cache_lookup(self.name, false);
                    return None;
                }
            }
        }

        let mut entries = self.entries.write().await;
        // Re-check under the write lock; a concurrent put may have refreshed it.
        if let Some(entry) = entries.get(key) {
            if !entry.is_expired(Instant::now()) {
                self.metrics.record_cache_lookup(self.name, true);
                return Some(entry.value.clone());
            }
        }
        entries.remove(key);
        debug!(cache = self.name, key = %key, "Cache entry expired");
        self.metrics.record_cache_lookup(self.name, false);
        None
    }

    pub async fn put(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = Instant::now();
        let key = key.into();
        debug!(cache = self.name, key = %key, ttl_secs = ttl.as_secs(), "Caching response");
        let entry = CacheEntry { value, cached_at: now, expires_at: now + ttl };
        self.entries.write().await.insert(key, entry);
    }

    pub async fn put_default(&self, key: impl Into<String>, value: V) {
        self.put(key, value, self.default_ttl).await;
    }

    pub async fn invalidate(&self, key: &str) {
        if self.entries.write().await.remove(key).is_some() {
            debug!(cache = self.name, key = %key, "Invalidated cache entry");
        }
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl<V> Clone for ResponseCache<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            entries: Arc::clone(&self.entries),
            default_ttl: self.default_ttl,
            metrics: self.metrics.clone(),
        }
    }
}
