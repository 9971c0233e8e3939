//! The bounded, expiring in-memory cache and its coalesced population logic.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use indexmap::IndexMap;

use crate::time::Instant;
use crate::{CacheConfig, CacheContents, CacheError, FetchOptions, fetch_with_retry};

/// A value stored in the cache together with its expiry deadline.
#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// An in-flight population for a single key.
///
/// All concurrent requesters for the key hold a clone of this future and
/// settle with the same outcome.
type PendingFetch<V> = Shared<BoxFuture<'static, CacheContents<V>>>;

struct CacheInner<K, V> {
    /// Stored entries, in insertion order. The first entry is the eviction
    /// candidate.
    entries: IndexMap<K, CacheEntry<V>>,
    /// Currently running fetches, keyed by the entry they will populate.
    pending: HashMap<K, PendingFetch<V>>,
}

impl<K: Eq + Hash, V: Clone> CacheInner<K, V> {
    /// Looks up the live value for `key`, purging the entry if its deadline
    /// has been reached.
    fn lookup(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        if Instant::now() < entry.expires_at {
            return Some(entry.value.clone());
        }

        tracing::trace!("entry expired, purging");
        self.entries.shift_remove(key);
        None
    }

    fn insert(&mut self, key: K, value: V, ttl: Duration, capacity: usize) {
        if self.entries.len() >= capacity && !self.entries.contains_key(&key) {
            // `shift_remove` keeps the insertion order of the remaining entries
            self.entries.shift_remove_index(0);
            tracing::trace!("capacity reached, evicted the oldest entry");
        }

        let expires_at = Instant::now() + ttl;
        self.entries.insert(key, CacheEntry { value, expires_at });
    }
}

/// Removes the pending record for a key when dropped.
///
/// Held by the fetch task so that even a panicking fetch cannot leave its key
/// permanently in flight.
struct Unregister<K: Eq + Hash, V> {
    inner: Arc<Mutex<CacheInner<K, V>>>,
    key: K,
}

impl<K: Eq + Hash, V> Drop for Unregister<K, V> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.pending.remove(&self.key);
        }
    }
}

/// A bounded, expiring, in-memory key/value cache with coalesced population.
///
/// The cache holds up to a configured number of entries, each with an expiry
/// deadline. Inserting past capacity evicts the oldest-inserted entry,
/// independent of access history. Expired entries are purged lazily on lookup.
///
/// Missing entries can be populated through [`get_or_fetch`](Self::get_or_fetch),
/// which deduplicates concurrent requests: only one fetch runs per key at a
/// time, and it is driven on a spawned task, so it settles and populates the
/// cache even when the requesters go away.
///
/// The cache is cheap to clone; clones share the same underlying state.
pub struct Cache<K, V> {
    config: CacheConfig,
    inner: Arc<Mutex<CacheInner<K, V>>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> std::fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (entries, pending) = self
            .inner
            .try_lock()
            .map(|inner| (inner.entries.len(), inner.pending.len()))
            .unwrap_or_default();
        f.debug_struct("Cache")
            .field("config", &self.config)
            .field("entries", &entries)
            .field("running fetches", &pending)
            .finish()
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new cache, validating the configuration.
    pub fn new(config: CacheConfig) -> CacheContents<Self> {
        config.validate()?;

        Ok(Self {
            config,
            inner: Arc::new(Mutex::new(CacheInner {
                entries: IndexMap::new(),
                pending: HashMap::new(),
            })),
        })
    }

    /// Stores `value` under `key` with the default TTL.
    ///
    /// If the cache is full and `key` is not already present, the
    /// oldest-inserted entry is evicted first. Overwriting an existing key
    /// replaces its value and refreshes its expiry, but keeps the key's
    /// original position in the eviction order.
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(key, value, self.config.default_ttl, self.config.capacity);
    }

    /// Stores `value` under `key` with an explicit TTL.
    ///
    /// Rejects a zero TTL with [`CacheError::InvalidConfiguration`], otherwise
    /// behaves like [`put`](Self::put).
    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) -> CacheContents {
        if ttl.is_zero() {
            return Err(CacheError::InvalidConfiguration(
                "ttl must be positive".into(),
            ));
        }

        let mut inner = self.inner.lock().unwrap();
        inner.insert(key, value, ttl, self.config.capacity);
        Ok(())
    }

    /// Returns the live value stored under `key`.
    ///
    /// An entry whose deadline has been reached is removed and reported as
    /// absent. Never triggers a fetch.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().unwrap().lookup(key)
    }

    /// Returns whether a live entry is stored under `key`.
    ///
    /// Applies the same lazy expiry purge as [`get`](Self::get).
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// The number of stored entries.
    ///
    /// Entries past their deadline still count until a lookup purges them.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Returns whether the cache stores no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all stored entries.
    ///
    /// In-flight fetches are not cancelled; when they settle, their results
    /// populate the cleared cache normally.
    pub fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    /// Returns the value for `key`, populating it with `fetch_op` if needed.
    ///
    /// If a live entry exists, it is returned immediately and `fetch_op` is
    /// not invoked. If a fetch for `key` is already in flight, this settles
    /// with the same outcome as that fetch, again without invoking `fetch_op`.
    /// Otherwise `fetch_op` is invoked exactly once and driven on a spawned
    /// task; on success, the result is stored under the default TTL.
    ///
    /// A failed fetch leaves no residue: the next call for the same key starts
    /// a fresh fetch. Dropping the returned future does not cancel a running
    /// fetch, it still settles and populates the cache for future reads.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch_op: F) -> CacheContents<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheContents<V>> + Send + 'static,
    {
        // The hit/attach/register decision happens under a single lock
        // acquisition, with no await in between: two tasks can never both
        // observe "absent and not pending" for the same key.
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(value) = inner.lookup(&key) {
                tracing::trace!("cache hit");
                return Ok(value);
            }

            match inner.pending.get(&key) {
                Some(pending) => {
                    tracing::debug!("attaching to the in-flight fetch");
                    pending.clone()
                }
                None => {
                    tracing::trace!("cache miss, starting a fetch");
                    let pending = self.spawn_fetch(key.clone(), fetch_op());
                    inner.pending.insert(key, pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch), with `fetch_op` wrapped in
    /// [`fetch_with_retry`] under the given options.
    pub async fn get_or_fetch_with<F, Fut>(
        &self,
        key: K,
        options: FetchOptions,
        fetch_op: F,
    ) -> CacheContents<V>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = CacheContents<V>> + Send + 'static,
    {
        self.get_or_fetch(key, move || async move {
            fetch_with_retry(&options, fetch_op).await
        })
        .await
    }

    /// Spawns `fetch` on a task and returns the shared future its waiters poll.
    ///
    /// The task keeps running even when every waiter is dropped. On success it
    /// stores the result through the regular insertion path, and its
    /// [`Unregister`] guard removes the pending record once it settles, panics
    /// included. A panicked task surfaces to waiters as
    /// [`CacheError::InternalError`].
    fn spawn_fetch(
        &self,
        key: K,
        fetch: impl Future<Output = CacheContents<V>> + Send + 'static,
    ) -> PendingFetch<V> {
        let unregister = Unregister {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
        };
        let cache = self.clone();

        let task = tokio::spawn(async move {
            let _unregister = unregister;
            let result = fetch.await;
            match &result {
                Ok(value) => {
                    cache.put(key, value.clone());
                    tracing::debug!("fetch settled, stored the entry");
                }
                Err(error) => tracing::debug!(%error, "fetch failed"),
            }
            result
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(_) => Err(CacheError::InternalError),
            }
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::{self, Duration};

    use super::*;
    use crate::setup;

    fn cache(capacity: usize) -> Cache<&'static str, u32> {
        Cache::new(CacheConfig {
            capacity,
            default_ttl: Duration::from_secs(60),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fifo_eviction() {
        setup();

        let cache = cache(2);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);

        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_eviction_keeps_newest_keys() {
        setup();

        let cache = cache(3);
        for (i, key) in ["a", "b", "c", "d", "e", "f"].into_iter().enumerate() {
            cache.put(key, i as u32);
        }

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&"d"), Some(3));
        assert_eq!(cache.get(&"e"), Some(4));
        assert_eq!(cache.get(&"f"), Some(5));
    }

    #[tokio::test]
    async fn test_overwrite_keeps_eviction_position() {
        setup();

        let cache = cache(2);
        cache.put("a", 1);
        cache.put("b", 2);
        // "a" keeps its front position in the eviction order
        cache.put("a", 10);
        cache.put("c", 3);

        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[tokio::test]
    async fn test_expiry() {
        setup();
        time::pause();

        let cache = cache(10);
        cache
            .put_with_ttl("x", 1, Duration::from_millis(10))
            .unwrap();
        assert_eq!(cache.get(&"x"), Some(1));
        assert!(cache.contains_key(&"x"));

        time::advance(Duration::from_millis(20)).await;
        assert_eq!(cache.get(&"x"), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        setup();

        let cache = cache(10);
        let result = cache.put_with_ttl("k", 1, Duration::ZERO);
        assert!(matches!(result, Err(CacheError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_coalesced_fetch() {
        setup();
        time::pause();

        let cache = cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let slow_fetch = || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::Relaxed);
                time::sleep(Duration::from_millis(100)).await;
                Ok(42)
            }
        };

        let res = futures::join!(
            cache.get_or_fetch("k", slow_fetch),
            cache.get_or_fetch("k", slow_fetch),
        );

        assert_eq!(res, (Ok(42), Ok(42)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        // the settled fetch populated the cache
        assert_eq!(cache.get(&"k"), Some(42));
    }

    #[tokio::test]
    async fn test_live_entry_skips_fetch() {
        setup();

        let cache = cache(10);
        cache.put("k", 1);

        let result = cache
            .get_or_fetch("k", || async { panic!("fetch should not run") })
            .await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_residue() {
        setup();

        let cache = cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let result = cache
            .get_or_fetch("k", {
                let calls = Arc::clone(&calls);
                move || async move {
                    calls.fetch_add(1, Ordering::Relaxed);
                    Err(CacheError::Fetch("boom".into()))
                }
            })
            .await;

        assert_eq!(result, Err(CacheError::Fetch("boom".into())));
        assert_eq!(cache.get(&"k"), None);

        // the next request starts over and can succeed
        let result = cache
            .get_or_fetch("k", {
                let calls = Arc::clone(&calls);
                move || async move {
                    calls.fetch_add(1, Ordering::Relaxed);
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_clear_while_fetching() {
        setup();
        time::pause();

        let cache = cache(10);
        let handle = tokio::spawn({
            let cache = cache.clone();
            async move {
                cache
                    .get_or_fetch("k", || async {
                        time::sleep(Duration::from_millis(100)).await;
                        Ok(5)
                    })
                    .await
            }
        });

        // let the fetch start, then wipe the cache under it
        time::sleep(Duration::from_millis(10)).await;
        cache.clear();
        assert!(cache.is_empty());

        assert_eq!(handle.await.unwrap(), Ok(5));
        assert_eq!(cache.get(&"k"), Some(5));
    }

    #[tokio::test]
    async fn test_abandoned_fetch_still_populates() {
        setup();
        time::pause();

        let cache = cache(10);
        {
            let fut = cache.get_or_fetch("k", || async {
                time::sleep(Duration::from_millis(100)).await;
                Ok(9)
            });
            // poll once so the fetch is registered, then drop the caller
            futures::pin_mut!(fut);
            assert!(futures::poll!(fut.as_mut()).is_pending());
        }

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.get(&"k"), Some(9));
    }

    #[tokio::test]
    async fn test_fetch_with_retry_composition() {
        setup();
        time::pause();

        let cache = cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let options = FetchOptions {
            max_attempts: 3,
            retry_delay: Duration::from_millis(20),
            timeout: None,
        };
        let result = cache
            .get_or_fetch_with("k", options, {
                let calls = Arc::clone(&calls);
                move || {
                    let attempt = calls.fetch_add(1, Ordering::Relaxed);
                    async move {
                        if attempt < 2 {
                            Err(CacheError::Fetch("flaky".into()))
                        } else {
                            Ok(11)
                        }
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(11));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(cache.get(&"k"), Some(11));
    }
}
