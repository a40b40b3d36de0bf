//! Read-through in-memory cache with an injected time-to-live.

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cloning shares the underlying store.
#[derive(Debug, Clone)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    store: Arc<DashMap<K, CacheEntry<V>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            store: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns a live entry, evicting it if it has expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let expired = match self.store.get(key) {
            Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.store.remove_if(key, |_, entry| entry.is_expired());
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        self.store.insert(key, CacheEntry::new(value, self.ttl));
    }

    pub fn invalidate(&self, key: &K) {
        self.store.remove(key);
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Returns the cached value or loads, stores and returns a fresh one.
    /// Load errors are returned as-is and nothing is cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        // No shard guard is held across the await.
        let value = load().await?;
        self.insert(key, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn loads_once_within_ttl() {
        let cache: TtlCache<i32, Vec<String>> = TtlCache::new(Duration::from_secs(60));
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let value = cache
                .get_or_try_insert_with(1, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(vec!["Ha Noi".to_string()])
                })
                .await
                .unwrap();
            assert_eq!(value, vec!["Ha Noi".to_string()]);
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_reloaded() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(Duration::from_millis(20));
        cache.insert("k", 1);
        assert_eq!(cache.get(&"k"), Some(1));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());

        let value = cache
            .get_or_try_insert_with("k", || async { Ok::<_, ()>(2) })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn failed_loads_are_not_cached() {
        let cache: TtlCache<u8, u8> = TtlCache::new(Duration::from_secs(60));
        let err = cache
            .get_or_try_insert_with(7, || async { Err::<u8, _>("carrier down") })
            .await
            .unwrap_err();
        assert_eq!(err, "carrier down");
        assert!(cache.get(&7).is_none());
    }

    #[test]
    fn clones_share_the_store() {
        let cache: TtlCache<u8, u8> = TtlCache::new(Duration::from_secs(60));
        let other = cache.clone();
        cache.insert(1, 10);
        assert_eq!(other.get(&1), Some(10));
        other.invalidate(&1);
        assert_eq!(cache.len(), 0);
    }
}
