use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;

use super::{FlightError, SingleFlightValue};

/// A map of keys to [`SingleFlightValue`]s.
///
/// Concurrent requests for the same key share a single computation. The check for an existing
/// entry and the creation of a new one happen in one critical section, and the lock is never
/// held while waiting for a computation.
///
/// Entries are never evicted on their own, including failed ones. Use [`remove`](Self::remove)
/// to allow a new attempt.
pub struct KeyedSingleFlightCache<K, V> {
    entries: Mutex<HashMap<K, SingleFlightValue<V>>>,
}

impl<K, V> Default for KeyedSingleFlightCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> std::fmt::Debug for KeyedSingleFlightCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.entries.lock().unwrap().len();
        f.debug_struct("KeyedSingleFlightCache")
            .field("entries", &len)
            .finish()
    }
}

impl<K, V> KeyedSingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, computing it with `producer` if there is no entry yet.
    ///
    /// `producer` is only invoked if this call created the entry.
    pub async fn fetch<F, Fut, E>(&self, key: K, producer: F) -> Result<V, FlightError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let value = self.get_or_insert(key, producer);
        value.get().await
    }

    /// Returns the entry for `key`, creating it from `producer` if it does not exist.
    ///
    /// The returned value is not started yet if it was just created.
    pub fn get_or_insert<F, Fut, E>(&self, key: K, producer: F) -> SingleFlightValue<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(key)
            .or_insert_with(|| SingleFlightValue::new(producer))
            .clone()
    }

    /// Returns the current entry for `key`, if any.
    pub fn get(&self, key: &K) -> Option<SingleFlightValue<V>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Removes the entry for `key`.
    ///
    /// Anyone already holding the removed value still receives its outcome.
    pub fn remove(&self, key: &K) -> Option<SingleFlightValue<V>> {
        self.entries.lock().unwrap().remove(key)
    }

    /// Removes the entry for `key` only if it is still `value`.
    ///
    /// Returns `true` if the entry was removed.
    pub fn remove_if_same(&self, key: &K, value: &SingleFlightValue<V>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(current) if current.ptr_eq(value) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Replaces the entry for `key` with a fresh one if it is still `stale`.
    ///
    /// Returns whatever entry is current afterwards.
    pub fn replace_if_same<F, Fut, E>(
        &self,
        key: K,
        stale: &SingleFlightValue<V>,
        producer: F,
    ) -> SingleFlightValue<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key).or_insert_with(|| stale.clone());
        if entry.ptr_eq(stale) {
            *entry = SingleFlightValue::new(producer);
        }
        entry.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all entries.
    pub fn clear(&self) {
        // drop the entries outside of the lock, which may abort their computations
        let entries = std::mem::take(&mut *self.entries.lock().unwrap());
        drop(entries);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use thiserror::Error;
    use tokio::sync::Barrier;

    use super::*;

    #[derive(Debug, Error)]
    #[error("not found")]
    struct NotFound;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_per_key() {
        let cache = Arc::new(KeyedSingleFlightCache::<&str, Arc<Vec<u8>>>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let requests = (0..20).map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .fetch("a", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, NotFound>(Arc::new(vec![1, 2, 3]))
                    })
                    .await
            })
        });
        let results: Vec<_> = futures::future::join_all(requests)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_distinct_keys_overlap() {
        let cache = Arc::new(KeyedSingleFlightCache::<u32, u32>::new());
        // both producers must be running at the same time to get past the barrier
        let barrier = Arc::new(Barrier::new(2));

        let fetch = |key: u32| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            async move {
                cache
                    .fetch(key, move || async move {
                        barrier.wait().await;
                        Ok::<_, NotFound>(key * 10)
                    })
                    .await
            }
        };

        let both = futures::future::join(fetch(1), fetch(2));
        let (a, b) = tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("fetches for distinct keys were serialized");

        assert_eq!(a.unwrap(), 10);
        assert_eq!(b.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_failure_stays_until_removed() {
        let cache = KeyedSingleFlightCache::<&str, u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let producer = |fail: bool| {
            let calls = calls.clone();
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail { Err(NotFound) } else { Ok(7) }
            }
        };

        assert!(cache.fetch("k", producer(true)).await.is_err());
        // the failed entry is kept, the new producer is ignored
        assert!(cache.fetch("k", producer(false)).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(cache.remove(&"k").is_some());
        assert_eq!(cache.fetch("k", producer(false)).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remove_keeps_waiters() {
        let cache = KeyedSingleFlightCache::<&str, u32>::new();
        let value = cache.get_or_insert("k", || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, NotFound>(1)
        });
        let waiting = tokio::spawn({
            let value = value.clone();
            async move { value.get().await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        cache.remove(&"k");
        assert!(cache.is_empty());
        assert_eq!(waiting.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_if_same() {
        let cache = KeyedSingleFlightCache::<&str, u32>::new();
        let first = cache.get_or_insert("k", || async { Ok::<_, NotFound>(1) });
        cache.remove(&"k");
        let second = cache.get_or_insert("k", || async { Ok::<_, NotFound>(2) });

        assert!(!cache.remove_if_same(&"k", &first));
        assert!(cache.get(&"k").unwrap().ptr_eq(&second));
        assert!(cache.remove_if_same(&"k", &second));
        assert!(cache.get(&"k").is_none());
    }

    #[tokio::test]
    async fn test_replace_if_same() {
        let cache = KeyedSingleFlightCache::<&str, u32>::new();
        let failed = cache.get_or_insert("k", || async { Err::<u32, _>(NotFound) });
        assert!(failed.get().await.is_err());

        let fresh = cache.replace_if_same("k", &failed, || async { Ok::<_, NotFound>(3) });
        assert!(!fresh.ptr_eq(&failed));
        assert_eq!(fresh.get().await.unwrap(), 3);

        // a second replacement with the stale value keeps the fresh entry
        let current = cache.replace_if_same("k", &failed, || async { Ok::<_, NotFound>(4) });
        assert!(current.ptr_eq(&fresh));
    }
}
