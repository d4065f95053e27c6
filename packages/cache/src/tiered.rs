//! Two-layer store: in-process entries in front of a remote store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::CacheError;
use crate::memory::MemoryStore;
use crate::store::KeyValueStore;

/// Upper bound on how long a remote hit is kept in the local layer.
pub const DEFAULT_LOCAL_TTL: Duration = Duration::from_secs(60);

/// Serves reads from a local [`MemoryStore`] before falling back to a
/// remote store, writing through to both.
///
/// The local layer never outlives the remote entry it mirrors by more than
/// `local_ttl`, so an invalidation on another process is observed within
/// that bound.
pub struct TieredStore {
    local: Arc<MemoryStore>,
    remote: Arc<dyn KeyValueStore>,
    local_ttl: Duration,
}

impl TieredStore {
    /// Stacks `local` in front of `remote`.
    #[must_use]
    pub fn new(local: Arc<MemoryStore>, remote: Arc<dyn KeyValueStore>) -> Self {
        Self {
            local,
            remote,
            local_ttl: DEFAULT_LOCAL_TTL,
        }
    }

    /// Overrides the local TTL cap.
    #[must_use]
    pub fn with_local_ttl(mut self, local_ttl: Duration) -> Self {
        self.local_ttl = local_ttl;
        self
    }

    /// The in-process layer.
    #[must_use]
    pub const fn local(&self) -> &Arc<MemoryStore> {
        &self.local
    }
}

#[async_trait]
impl KeyValueStore for TieredStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if let Some(value) = self.local.get(key).await? {
            return Ok(Some(value));
        }

        let value = self.remote.get(key).await?;
        if let Some(value) = &value {
            self.local.set(key, value.clone(), self.local_ttl).await?;
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.local
            .set(key, value.clone(), ttl.min(self.local_ttl))
            .await?;
        self.remote.set(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        let local = self.local.delete(keys).await?;
        let remote = self.remote.delete(keys).await?;
        Ok(local.max(remote))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut keys: BTreeSet<String> = self.local.keys(pattern).await?.into_iter().collect();
        keys.extend(self.remote.keys(pattern).await?);
        Ok(keys.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheStore;
    use crate::store::tests::UnavailableStore;

    const TTL: Duration = Duration::from_secs(300);

    fn tiered() -> (Arc<MemoryStore>, Arc<MemoryStore>, TieredStore) {
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryStore::new());
        let store = TieredStore::new(local.clone(), remote.clone());
        (local, remote, store)
    }

    #[tokio::test]
    async fn remote_hits_backfill_the_local_layer() {
        let (local, remote, store) = tiered();
        remote.set("k", "v".to_string(), TTL).await.unwrap();

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(local.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test(start_paused = true)]
    async fn local_copies_are_capped() {
        let (local, remote, store) = tiered();
        store.set("k", "v".to_string(), TTL).await.unwrap();

        tokio::time::advance(DEFAULT_LOCAL_TTL).await;

        assert_eq!(local.get("k").await.unwrap(), None);
        assert_eq!(remote.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn deletes_reach_both_layers() {
        let (local, remote, store) = tiered();
        store.set("map:bounds:a", "1".to_string(), TTL).await.unwrap();
        store.set("map:bounds:b", "2".to_string(), TTL).await.unwrap();

        let cache = CacheStore::new(Arc::new(store));
        assert_eq!(cache.delete_by_pattern("map:bounds:*").await, Some(2));
        assert!(local.is_empty());
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn remote_outage_surfaces_as_miss_through_cache_store() {
        let local = Arc::new(MemoryStore::new());
        let store = TieredStore::new(local, Arc::new(UnavailableStore));
        let cache = CacheStore::new(Arc::new(store));

        assert_eq!(cache.get::<i32>("k").await, None);
    }
}
