//! Single-flight read cache with a short time-to-live.
//!
//! Every key maps to a shared `OnceCell`. The first caller for a key runs the
//! fetch; callers arriving while it is in flight await the same cell and get
//! the same value. Once the TTL has elapsed the next lookup swaps in a fresh
//! cell, so stale values are never served and expired entries can be evicted
//! by a sweep. Failed fetches leave the cell empty and are not cached.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::blockchain::types::{LedgerError, LedgerResult};
use crate::observability::metrics;

struct Cached<V> {
    value: V,
    fetched_at: Instant,
}

pub struct SingleFlightCache<K, V> {
    name: &'static str,
    ttl: Duration,
    entries: DashMap<K, Arc<OnceCell<Cached<V>>>>,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Return the cached value for `key` or run `fetch`, sharing it with concurrent callers.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> LedgerResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LedgerResult<V>>,
    {
        let cell = self.cell_for(key);
        let fetched = AtomicBool::new(false);

        let cached = cell
            .get_or_try_init(|| async {
                fetched.store(true, Ordering::Relaxed);
                let value = fetch().await?;
                Ok::<_, LedgerError>(Cached {
                    value,
                    fetched_at: Instant::now(),
                })
            })
            .await?;

        metrics::record_cache_lookup(self.name, fetched.load(Ordering::Relaxed));
        Ok(cached.value.clone())
    }

    fn cell_for(&self, key: K) -> Arc<OnceCell<Cached<V>>> {
        let mut entry = self
            .entries
            .entry(key)
            .or_insert_with(|| Arc::new(OnceCell::new()));

        let expired = entry
            .value()
            .get()
            .map(|cached| cached.fetched_at.elapsed() >= self.ttl)
            .unwrap_or(false);
        if expired {
            *entry.value_mut() = Arc::new(OnceCell::new());
        }

        entry.value().clone()
    }

    /// Drop the entry so the next lookup goes to the ledger.
    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Remove every populated entry older than the TTL. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, cell| match cell.get() {
            Some(cached) => cached.fetched_at.elapsed() < self.ttl,
            // In flight (or failed); a later lookup reuses or replaces it.
            None => Arc::strong_count(cell) > 1,
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_fetch() {
        let cache: Arc<SingleFlightCache<u64, u64>> =
            Arc::new(SingleFlightCache::new("test", Duration::from_secs(5)));
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(7, || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_expires_after_ttl() {
        let cache: SingleFlightCache<&'static str, u64> =
            SingleFlightCache::new("test", Duration::from_secs(5));

        let first = cache.get_or_fetch("k", || async { Ok(1) }).await.unwrap();
        let cached = cache.get_or_fetch("k", || async { Ok(2) }).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(cached, 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        let refreshed = cache.get_or_fetch("k", || async { Ok(3) }).await.unwrap();
        assert_eq!(refreshed, 3);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let cache: SingleFlightCache<u8, u8> =
            SingleFlightCache::new("test", Duration::from_secs(5));

        let err = cache
            .get_or_fetch(1, || async { Err(LedgerError::Connection("down".into())) })
            .await;
        assert!(err.is_err());

        let ok = cache.get_or_fetch(1, || async { Ok(9) }).await.unwrap();
        assert_eq!(ok, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_evict() {
        let cache: SingleFlightCache<u8, u8> =
            SingleFlightCache::new("test", Duration::from_secs(5));
        cache.get_or_fetch(1, || async { Ok(1) }).await.unwrap();
        cache.get_or_fetch(2, || async { Ok(2) }).await.unwrap();

        cache.invalidate(&1);
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }
}
