//! In-memory metadata cache for model and test descriptors.
//!
//! Entries expire after a per-entry TTL. Expiry is checked on read: an
//! expired entry is dropped and reported as a miss, never served stale.
//! There is no background sweeper.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::types::{Descriptor, EntityKind, ModelDescriptor, TestDescriptor};

/// Default descriptor TTL (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

type CacheKey = (EntityKind, String);

#[derive(Debug, Clone)]
struct CacheEntry {
    descriptor: Descriptor,
    /// `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(at) => at > Instant::now(),
            None => true,
        }
    }
}

/// TTL-bounded descriptor cache, shared across concurrent runs.
#[derive(Debug, Clone, Default)]
pub struct MetadataCache {
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
    /// Per-key locks serializing population.
    populating: Arc<Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached descriptor if present and unexpired.
    pub async fn get(&self, kind: EntityKind, id: &str) -> Option<Descriptor> {
        let key = (kind, id.to_string());
        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                None => {
                    debug!(%kind, id, "cache miss");
                    return None;
                }
                Some(entry) if entry.is_fresh() => {
                    debug!(%kind, id, "cache hit");
                    return Some(entry.descriptor.clone());
                }
                Some(_) => {}
            }
        }

        // Expired: evict under the write lock, re-checking in case a writer
        // replaced the entry in between.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(&key) {
            if entry.is_fresh() {
                return Some(entry.descriptor.clone());
            }
            entries.remove(&key);
            debug!(%kind, id, "cache entry expired");
        }
        None
    }

    pub async fn get_model(&self, id: &str) -> Option<ModelDescriptor> {
        match self.get(EntityKind::Model, id).await {
            Some(Descriptor::Model(model)) => Some(model),
            _ => None,
        }
    }

    pub async fn get_test(&self, id: &str) -> Option<TestDescriptor> {
        match self.get(EntityKind::Test, id).await {
            Some(Descriptor::Test(test)) => Some(test),
            _ => None,
        }
    }

    /// Store a descriptor under its own kind and id for `ttl`.
    pub async fn put(&self, descriptor: impl Into<Descriptor>, ttl: Duration) {
        let descriptor = descriptor.into();
        let key = (descriptor.kind(), descriptor.id().to_string());
        self.insert(key, descriptor, ttl).await;
    }

    async fn insert(&self, key: CacheKey, descriptor: Descriptor, ttl: Duration) {
        debug!(kind = %key.0, id = %key.1, ttl_secs = ttl.as_secs(), "caching descriptor");
        self.entries.write().await.insert(
            key,
            CacheEntry {
                descriptor,
                expires_at: Instant::now().checked_add(ttl),
            },
        );
    }

    /// Cached descriptor, or the result of `fetch` stored for `ttl`.
    ///
    /// The result is stored under the requested `(kind, id)`, which for alias
    /// lookups is the alias key rather than the descriptor's own id.
    ///
    /// Concurrent callers for the same key share one fetch: the first holds
    /// the key's population lock, the rest wait and then read its result. A
    /// failed fetch stores nothing and the error goes to the caller that ran it.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        kind: EntityKind,
        id: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<Descriptor, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Descriptor, E>>,
    {
        if let Some(hit) = self.get(kind, id).await {
            return Ok(hit);
        }

        let key = (kind, id.to_string());
        let key_lock = {
            let mut populating = self.populating.lock().await;
            // Locks left by cancelled callers have no other holder.
            populating.retain(|_, lock| Arc::strong_count(lock) > 1);
            populating.entry(key.clone()).or_default().clone()
        };

        let outcome = self.populate(&key, &key_lock, ttl, fetch).await;

        drop(key_lock);
        let mut populating = self.populating.lock().await;
        if populating
            .get(&key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            populating.remove(&key);
        }

        outcome
    }

    async fn populate<F, Fut, E>(
        &self,
        key: &CacheKey,
        key_lock: &Mutex<()>,
        ttl: Duration,
        fetch: F,
    ) -> Result<Descriptor, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Descriptor, E>>,
    {
        let _guard = key_lock.lock().await;

        if let Some(hit) = self.get(key.0, &key.1).await {
            return Ok(hit);
        }

        let descriptor = fetch().await?;
        self.insert(key.clone(), descriptor.clone(), ttl).await;
        Ok(descriptor)
    }

    /// Drop one entry.
    pub async fn invalidate(&self, kind: EntityKind, id: &str) {
        self.entries.write().await.remove(&(kind, id.to_string()));
    }

    /// Drop everything.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
        debug!("cleared metadata cache");
    }

    /// Number of stored entries, expired ones included until next read.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    #[cfg(test)]
    async fn population_locks(&self) -> usize {
        self.populating.lock().await.len()
    }
}
