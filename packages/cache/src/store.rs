//! The key/value primitive and the look-aside wrapper built on it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::CacheError;

/// A key/value store holding string payloads with per-entry TTLs.
///
/// Implementations must be safe to share across tasks. Every operation is
/// independent per key; there are no cross-key transactions.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the payload stored under `key`, or `None` if absent/expired.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Stores `value` under `key`, replacing any previous entry wholesale.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Deletes the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Enumerates the live keys matching a glob `pattern`.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;
}

/// Look-aside cache over a [`KeyValueStore`].
///
/// Payloads are JSON. No backend error ever reaches the caller: failed
/// reads behave as misses, failed writes as no-ops, and failed deletes are
/// reported through the return value only. All failures are logged.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn KeyValueStore>,
}

impl CacheStore {
    /// Wraps a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Looks up and decodes the payload under `key`.
    ///
    /// Returns `None` on a miss, on any store error, and on a payload that
    /// no longer decodes as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                log::debug!("Cache MISS for key: {key}");
                return None;
            }
            Err(e) => {
                log::warn!("Cache read failed for {key}, treating as miss: {e}");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                log::debug!("Cache HIT for key: {key}");
                Some(value)
            }
            Err(e) => {
                log::warn!("Discarding undecodable cache entry {key}: {e}");
                None
            }
        }
    }

    /// Encodes and stores `value` under `key`.
    ///
    /// Completes once the store has answered; failures are logged and
    /// otherwise ignored.
    pub async fn set<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Failed to encode cache entry {key}: {e}");
                return;
            }
        };

        match self.backend.set(key, raw, ttl).await {
            Ok(()) => log::debug!("Cache SET for key: {key} (TTL: {}s)", ttl.as_secs()),
            Err(e) => log::warn!("Cache write failed for {key}: {e}"),
        }
    }

    /// Deletes a single key.
    ///
    /// Returns `true` once the store acknowledged the delete, whether or not
    /// the key existed, so deleting twice is observably the same as once.
    pub async fn delete(&self, key: &str) -> bool {
        match self.backend.delete(&[key.to_string()]).await {
            Ok(removed) => {
                log::debug!("Cache DEL for key: {key} (removed {removed})");
                true
            }
            Err(e) => {
                log::warn!("Cache delete failed for {key}: {e}");
                false
            }
        }
    }

    /// Deletes every key matching a glob pattern.
    ///
    /// Returns the number of removed keys, or `None` if enumeration or the
    /// delete failed. A pattern matching nothing is a successful `Some(0)`.
    pub async fn delete_by_pattern(&self, pattern: &str) -> Option<u64> {
        let keys = match self.backend.keys(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                log::warn!("Cache key enumeration failed for {pattern}: {e}");
                return None;
            }
        };

        if keys.is_empty() {
            log::debug!("Cache DEL pattern {pattern}: no matching keys");
            return Some(0);
        }

        match self.backend.delete(&keys).await {
            Ok(removed) => {
                log::debug!("Cache DEL pattern {pattern}: removed {removed} keys");
                Some(removed)
            }
            Err(e) => {
                log::warn!("Cache delete failed for pattern {pattern}: {e}");
                None
            }
        }
    }

    /// Drops every entry. Used at logout and navigation boundaries.
    pub async fn clear(&self) -> Option<u64> {
        self.delete_by_pattern("*").await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::MemoryStore;

    /// A store whose every operation fails, standing in for an unreachable
    /// remote service.
    pub struct UnavailableStore;

    #[async_trait]
    impl KeyValueStore for UnavailableStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(unavailable())
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            Err(unavailable())
        }

        async fn delete(&self, _keys: &[String]) -> Result<u64, CacheError> {
            Err(unavailable())
        }

        async fn keys(&self, _pattern: &str) -> Result<Vec<String>, CacheError> {
            Err(unavailable())
        }
    }

    fn unavailable() -> CacheError {
        CacheError::Backend {
            message: "connection refused".to_string(),
        }
    }

    fn memory_cache() -> CacheStore {
        CacheStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn round_trips_within_ttl_and_expires_after() {
        let cache = memory_cache();
        cache
            .set("report:r1", &vec![1, 2, 3], Duration::from_secs(300))
            .await;

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get::<Vec<i32>>("report:r1").await, Some(vec![1, 2, 3]));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get::<Vec<i32>>("report:r1").await, None);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let cache = memory_cache();
        cache.set("report:r1", &"x", Duration::from_secs(60)).await;

        assert!(cache.delete("report:r1").await);
        assert_eq!(cache.get::<String>("report:r1").await, None);
        assert!(cache.delete("report:r1").await);
        assert_eq!(cache.get::<String>("report:r1").await, None);
    }

    #[tokio::test]
    async fn pattern_delete_leaves_other_users_untouched() {
        let cache = memory_cache();
        let ttl = Duration::from_secs(300);
        cache.set("user:saved-reports:U1:page1:limit10", &1, ttl).await;
        cache.set("user:saved-reports:U1:page2:limit10", &2, ttl).await;
        cache.set("user:saved-reports:U2:page1:limit10", &3, ttl).await;

        assert_eq!(
            cache.delete_by_pattern("user:saved-reports:U1:*").await,
            Some(2)
        );
        assert_eq!(
            cache.get::<i32>("user:saved-reports:U1:page1:limit10").await,
            None
        );
        assert_eq!(
            cache.get::<i32>("user:saved-reports:U1:page2:limit10").await,
            None
        );
        assert_eq!(
            cache.get::<i32>("user:saved-reports:U2:page1:limit10").await,
            Some(3)
        );
    }

    #[tokio::test]
    async fn pattern_without_matches_is_a_successful_no_op() {
        let cache = memory_cache();
        assert_eq!(cache.delete_by_pattern("map:bounds:*").await, Some(0));
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_misses() {
        let cache = CacheStore::new(Arc::new(UnavailableStore));
        cache.set("report:r1", &1, Duration::from_secs(60)).await;
        assert_eq!(cache.get::<i32>("report:r1").await, None);
        assert!(!cache.delete("report:r1").await);
        assert_eq!(cache.delete_by_pattern("map:bounds:*").await, None);
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("report:r1", "not json".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        let cache = CacheStore::new(store);
        assert_eq!(cache.get::<i32>("report:r1").await, None);
    }
}
