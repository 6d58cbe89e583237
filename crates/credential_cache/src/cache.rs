//! Single-flight TTL cache
//!
//! A fresh entry is served under a shared read lock. An absent or expired
//! entry is refreshed at most once concurrently per key: the first caller
//! installs a shared pending future, later callers await the same one.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use contracts::TransformError;
use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tracing::{debug, warn};

type SharedRefresh<V, E> = Shared<BoxFuture<'static, Result<V, CacheError<E>>>>;

/// Refresh failure observed by every waiter of one computation
#[derive(Debug, Error)]
pub enum CacheError<E> {
    #[error("{0}")]
    Refresh(Arc<E>),

    #[error("{cache} refresh panicked")]
    Panicked { cache: &'static str },
}

impl<E> CacheError<E> {
    /// The compute failure; `None` when the computation panicked
    pub fn inner(&self) -> Option<&E> {
        match self {
            Self::Refresh(e) => Some(e),
            Self::Panicked { .. } => None,
        }
    }
}

impl<E> Clone for CacheError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Refresh(e) => Self::Refresh(Arc::clone(e)),
            Self::Panicked { cache } => Self::Panicked { cache },
        }
    }
}

/// An unreachable credential issuer is an upstream (5xx) failure
impl<E: std::fmt::Display> From<CacheError<E>> for TransformError {
    fn from(error: CacheError<E>) -> Self {
        TransformError::upstream(error.to_string())
    }
}

enum Slot<V, E> {
    Ready { value: V, expires_at: Instant },
    Pending { generation: u64, refresh: SharedRefresh<V, E> },
}

enum Lookup<V, E> {
    Fresh(V),
    Pending(SharedRefresh<V, E>),
    Miss,
}

/// Key -> value cache with per-instance TTL and single-flight refresh
pub struct CredentialCache<K, V, E> {
    name: &'static str,
    ttl: Duration,
    slots: Arc<RwLock<HashMap<K, Slot<V, E>>>>,
    generation: AtomicU64,
    stats: Arc<CacheStats>,
}

impl<K, V, E> CredentialCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// `name` labels metrics and logs
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            slots: Arc::new(RwLock::new(HashMap::new())),
            generation: AtomicU64::new(0),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Fresh value without triggering a refresh
    pub fn peek(&self, key: &K) -> Option<V> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        match Self::lookup_in(&slots, key) {
            Lookup::Fresh(value) => Some(value),
            _ => None,
        }
    }

    /// Return the fresh value for `key`, computing it when absent or expired
    ///
    /// `compute` is invoked only by the caller that starts a refresh.
    /// Every concurrent caller for the key receives the same outcome; a
    /// failed outcome is not cached.
    pub async fn get<F, Fut>(&self, key: K, compute: F) -> Result<V, CacheError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let fast = {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            Self::lookup_in(&slots, &key)
        };

        let refresh = match fast {
            Lookup::Fresh(value) => {
                self.record_hit();
                return Ok(value);
            }
            Lookup::Pending(refresh) => {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                refresh
            }
            Lookup::Miss => {
                let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
                match Self::lookup_in(&slots, &key) {
                    Lookup::Fresh(value) => {
                        self.record_hit();
                        return Ok(value);
                    }
                    Lookup::Pending(refresh) => {
                        self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                        refresh
                    }
                    Lookup::Miss => {
                        let (generation, refresh) = self.start_refresh(key.clone(), compute());
                        slots.insert(
                            key,
                            Slot::Pending {
                                generation,
                                refresh: refresh.clone(),
                            },
                        );
                        refresh
                    }
                }
            }
        };

        refresh.await
    }

    /// Drop the entry for `key`; an in-flight refresh no longer updates it
    pub fn invalidate(&self, key: &K) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Number of stored entries, pending and expired included
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup_in(slots: &HashMap<K, Slot<V, E>>, key: &K) -> Lookup<V, E> {
        match slots.get(key) {
            Some(Slot::Ready { value, expires_at }) if Instant::now() < *expires_at => {
                Lookup::Fresh(value.clone())
            }
            Some(Slot::Pending { refresh, .. }) => Lookup::Pending(refresh.clone()),
            _ => Lookup::Miss,
        }
    }

    fn record_hit(&self) {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        observability::metrics::record_credential_cache_hit(self.name);
    }

    /// The returned future settles the slot itself, so the outcome is stored
    /// even if the starting caller is dropped mid-await.
    fn start_refresh<Fut>(&self, key: K, compute: Fut) -> (u64, SharedRefresh<V, E>)
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let slots = Arc::clone(&self.slots);
        let stats = Arc::clone(&self.stats);
        let ttl = self.ttl;
        let name = self.name;
        self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(cache = name, generation, "credential refresh started");

        let refresh = async move {
            let outcome = match AssertUnwindSafe(compute).catch_unwind().await {
                Ok(computed) => computed.map_err(|e| CacheError::Refresh(Arc::new(e))),
                Err(_) => Err(CacheError::Panicked { cache: name }),
            };

            let mut slots = slots.write().unwrap_or_else(PoisonError::into_inner);
            let owns_slot = matches!(
                slots.get(&key),
                Some(Slot::Pending { generation: g, .. }) if *g == generation
            );
            match &outcome {
                Ok(value) => {
                    observability::metrics::record_credential_cache_refresh(name);
                    if owns_slot {
                        slots.insert(
                            key,
                            Slot::Ready {
                                value: value.clone(),
                                expires_at: Instant::now() + ttl,
                            },
                        );
                    }
                }
                Err(_) => {
                    stats.refresh_errors.fetch_add(1, Ordering::Relaxed);
                    observability::metrics::record_credential_cache_refresh_error(name);
                    warn!(cache = name, generation, "credential refresh failed");
                    if owns_slot {
                        slots.remove(&key);
                    }
                }
            }
            outcome
        }
        .boxed()
        .shared();

        (generation, refresh)
    }
}

/// Cache counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    refreshes: AtomicU64,
    coalesced: AtomicU64,
    refresh_errors: AtomicU64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            refresh_errors: self.refresh_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Fresh entries served
    pub hits: u64,
    /// Computations started
    pub refreshes: u64,
    /// Callers that joined an in-flight computation
    pub coalesced: u64,
    /// Computations that failed
    pub refresh_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[derive(Debug, PartialEq)]
    struct IssuerDown;

    impl std::fmt::Display for IssuerDown {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("issuer down")
        }
    }

    fn counting_compute(
        calls: &Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<String, IssuerDown>> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                Ok(value.to_string())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_computation() {
        let cache: CredentialCache<&str, String, IssuerDown> =
            CredentialCache::new("test", Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let results = join_all(
            (0..50).map(|_| cache.get("acct|ws", counting_compute(&calls, "token-1"))),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_deref().ok() == Some("token-1")));

        let stats = cache.stats();
        assert_eq!(stats.refreshes, 1);
        assert_eq!(stats.coalesced, 49);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_across_tasks() {
        let cache: Arc<CredentialCache<String, String, IssuerDown>> =
            Arc::new(CredentialCache::new("test", Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let compute = counting_compute(&calls, "shared");
                tokio::spawn(async move { cache.get("k".to_string(), compute).await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_entry_skips_compute() {
        let cache: CredentialCache<&str, String, IssuerDown> =
            CredentialCache::new("test", Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get("k", counting_compute(&calls, "v1")).await.unwrap();
        let again = cache.get("k", counting_compute(&calls, "v2")).await.unwrap();

        assert_eq!(again, "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.peek(&"k"), Some("v1".to_string()));
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let cache: CredentialCache<&str, String, IssuerDown> =
            CredentialCache::new("test", Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = || {
            let calls = Arc::clone(&calls);
            move || {
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(10)).await;
                    Err::<String, _>(IssuerDown)
                }
                .boxed()
            }
        };

        let results = join_all((0..5).map(|_| cache.get("k", failing()))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in &results {
            let err = result.as_ref().unwrap_err();
            assert_eq!(err.inner(), Some(&IssuerDown));
            assert_eq!(err.to_string(), "issuer down");
        }
        assert!(cache.is_empty());

        let recovered = cache.get("k", counting_compute(&calls, "ok")).await.unwrap();
        assert_eq!(recovered, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().refresh_errors, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refreshed() {
        let cache: CredentialCache<&str, String, IssuerDown> =
            CredentialCache::new("test", Duration::from_millis(30));
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get("k", counting_compute(&calls, "v1")).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.peek(&"k"), None);

        let refreshed = cache.get("k", counting_compute(&calls, "v2")).await.unwrap();
        assert_eq!(refreshed, "v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_gets_on_expired_key_refresh_once() {
        let cache: CredentialCache<&str, String, IssuerDown> =
            CredentialCache::new("test", Duration::from_millis(30));
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get("k", counting_compute(&calls, "v1")).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.peek(&"k"), None);

        let results =
            join_all((0..20).map(|_| cache.get("k", counting_compute(&calls, "v2")))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(results.iter().all(|r| r.as_deref().ok() == Some("v2")));
        let stats = cache.stats();
        assert_eq!(stats.refreshes, 2);
        assert_eq!(stats.coalesced, 19);
    }

    #[tokio::test]
    async fn test_panicking_refresh_is_not_cached() {
        let cache: CredentialCache<&str, String, IssuerDown> =
            CredentialCache::new("test", Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let panicking = || -> BoxFuture<'static, Result<String, IssuerDown>> {
            async {
                sleep(Duration::from_millis(10)).await;
                panic!("token issuer client bug")
            }
            .boxed()
        };
        let results = join_all((0..3).map(|_| cache.get("k", panicking))).await;
        for result in &results {
            let err = result.as_ref().unwrap_err();
            assert!(matches!(err, CacheError::Panicked { cache: "test" }));
            assert!(err.inner().is_none());
        }
        assert!(cache.is_empty());

        let recovered = cache.get("k", counting_compute(&calls, "ok")).await.unwrap();
        assert_eq!(recovered, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().refresh_errors, 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let cache: CredentialCache<&str, String, IssuerDown> =
            CredentialCache::new("test", Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = futures::join!(
            cache.get("a", counting_compute(&calls, "va")),
            cache.get("b", counting_compute(&calls, "vb"))
        );
        assert_eq!(a.unwrap(), "va");
        assert_eq!(b.unwrap(), "vb");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_error_maps_to_upstream_transform_error() {
        let error: TransformError = CacheError::Refresh(Arc::new(IssuerDown)).into();
        assert_eq!(error.status, 500);
        assert_eq!(error.message, "issuer down");
    }
}
