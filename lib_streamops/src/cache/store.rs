//! # Query Cache
//!
//! Key-addressed store of server-derived JSON snapshots.
//!
//! Values are held as `Arc<Value>` and replaced whole, so a reader holding a
//! snapshot never observes a half-applied update. The lock is a std `RwLock`
//! and is never held across an `.await`.
//!
//! Reads through [`QueryCache::fetch`] follow stale-while-revalidate: a stale
//! entry is returned immediately and a single background refetch per key is
//! spawned. An invalidation that lands while a fetch for the same key is in
//! flight keeps the stored result marked stale, so a response computed before
//! the invalidation can never pass for fresh. A direct `set` or `merge` during
//! the fetch wins over the response, which is then discarded.
//!
//! In-flight registrations are released when the fetch future is dropped, so
//! a cancelled poll or a timed-out read never blocks later revalidation.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;

use super::key::{CacheKey, EntityKind, KeyFilter};

const CHANGE_FEED_CAPACITY: usize = 256;

/// Max-age per entity kind. Kinds without an override use
/// [`EntityKind::max_age`].
#[derive(Debug, Clone, Default)]
pub struct StalenessPolicy {
    overrides: HashMap<EntityKind, Duration>,
}

impl StalenessPolicy {
    pub fn with_max_age(mut self, kind: EntityKind, max_age: Duration) -> Self {
        self.overrides.insert(kind, max_age);
        self
    }

    pub fn max_age(&self, kind: EntityKind) -> Duration {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.max_age())
    }
}

/// A snapshot handed out by [`QueryCache::get`].
#[derive(Debug, Clone)]
pub struct CachedValue {
    pub value: Arc<Value>,
    /// Invalidated or older than the kind's max-age.
    pub stale: bool,
}

/// Change feed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    Updated(CacheKey),
    Invalidated(CacheKey),
    Removed(CacheKey),
}

impl CacheChange {
    pub fn key(&self) -> &CacheKey {
        match self {
            CacheChange::Updated(k) | CacheChange::Invalidated(k) | CacheChange::Removed(k) => k,
        }
    }
}

struct Entry {
    value: Arc<Value>,
    fetched_at: Instant,
    invalidated: bool,
}

#[derive(Default)]
struct InFlight {
    count: u32,
    invalidated: bool,
    /// A direct write landed after the fetch began.
    superseded: bool,
}

#[derive(Default)]
struct State {
    entries: HashMap<CacheKey, Entry>,
    in_flight: HashMap<CacheKey, InFlight>,
}

struct Inner {
    state: RwLock<State>,
    policy: StalenessPolicy,
    changes: broadcast::Sender<CacheChange>,
}

/// Shared handle to the cache. Clones point at the same store.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("QueryCache")
            .field("entries", &state.entries.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self::with_policy(StalenessPolicy::default())
    }

    pub fn with_policy(policy: StalenessPolicy) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                policy,
                changes,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, change: CacheChange) {
        // No receivers is fine.
        let _ = self.inner.changes.send(change);
    }

    /// Subscribes to the change feed. Slow receivers lag and skip items
    /// rather than block writers.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.inner.changes.subscribe()
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        let state = self.read();
        let entry = state.entries.get(key)?;
        let stale = entry.invalidated
            || entry.fetched_at.elapsed() > self.inner.policy.max_age(key.kind);
        Some(CachedValue {
            value: Arc::clone(&entry.value),
            stale,
        })
    }

    /// Typed read of the current snapshot, ignoring staleness.
    pub fn get_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let cached = self.get(key)?;
        match serde_json::from_value(Value::clone(&cached.value)) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Cached value at {} has an unexpected shape: {}", key, e);
                None
            }
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.read().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.read().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stores a fresh value, replacing any previous one.
    pub fn set(&self, key: CacheKey, value: Value) {
        {
            let mut state = self.write();
            Self::supersede_fetch(&mut state, &key);
            state.entries.insert(
                key.clone(),
                Entry {
                    value: Arc::new(value),
                    fetched_at: Instant::now(),
                    invalidated: false,
                },
            );
        }
        self.notify(CacheChange::Updated(key));
    }

    /// Overlays the top-level fields of `patch` onto the cached object.
    ///
    /// Non-object values are replaced. When nothing is cached yet the patch is
    /// stored as-is but marked stale, since it may be a partial entity.
    /// Returns whether an entry existed.
    pub fn merge(&self, key: CacheKey, patch: Value) -> bool {
        let existed = {
            let mut state = self.write();
            Self::supersede_fetch(&mut state, &key);
            match state.entries.get_mut(&key) {
                Some(entry) => {
                    entry.value = Arc::new(merge_values(&entry.value, patch));
                    true
                }
                None => {
                    state.entries.insert(
                        key.clone(),
                        Entry {
                            value: Arc::new(patch),
                            fetched_at: Instant::now(),
                            invalidated: true,
                        },
                    );
                    false
                }
            }
        };
        self.notify(CacheChange::Updated(key));
        existed
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        let removed = self.write().entries.remove(key).is_some();
        if removed {
            self.notify(CacheChange::Removed(key.clone()));
        }
        removed
    }

    /// Marks one entry stale. Returns whether it was cached.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.invalidate_matching(&KeyFilter::Exact(key.clone())) > 0
    }

    /// Marks every matching entry stale and flags matching in-flight fetches.
    /// Returns the number of cached entries affected.
    pub fn invalidate_matching(&self, filter: &KeyFilter) -> usize {
        let invalidated: Vec<CacheKey> = {
            let mut state = self.write();
            for (key, flight) in state.in_flight.iter_mut() {
                if filter.matches(key) {
                    flight.invalidated = true;
                }
            }
            state
                .entries
                .iter_mut()
                .filter(|(key, _)| filter.matches(key))
                .map(|(key, entry)| {
                    entry.invalidated = true;
                    key.clone()
                })
                .collect()
        };

        if !invalidated.is_empty() {
            tracing::debug!("Invalidated {} cache entries ({:?})", invalidated.len(), filter);
        }
        let count = invalidated.len();
        for key in invalidated {
            self.notify(CacheChange::Invalidated(key));
        }
        count
    }

    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.read().in_flight.contains_key(key)
    }

    /// Reads `key` with stale-while-revalidate.
    ///
    /// - fresh entry: returned as is;
    /// - stale entry: returned as is, and one background refetch is spawned
    ///   unless one is already running for this key;
    /// - no entry: `fetcher` is awaited and its result stored.
    pub async fn fetch<F, Fut, E>(&self, key: CacheKey, fetcher: F) -> Result<Arc<Value>, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if let Some(cached) = self.get(&key) {
            if cached.stale {
                self.revalidate(key, fetcher);
            }
            return Ok(cached.value);
        }
        self.refresh(key, fetcher()).await
    }

    /// Awaits `request` and stores its result, regardless of freshness.
    /// A failed request leaves the existing entry untouched.
    pub async fn refresh<Fut, E>(&self, key: CacheKey, request: Fut) -> Result<Arc<Value>, E>
    where
        Fut: Future<Output = Result<Value, E>>,
    {
        let flight = self.begin_fetch(key);
        request.await.map(|value| flight.complete(value))
    }

    fn revalidate<F, Fut, E>(&self, key: CacheKey, fetcher: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        {
            let mut state = self.write();
            if state.in_flight.contains_key(&key) {
                tracing::trace!("Refetch of {} already in flight", key);
                return;
            }
            state.in_flight.insert(
                key.clone(),
                InFlight {
                    count: 1,
                    ..InFlight::default()
                },
            );
        }

        tracing::debug!("Revalidating stale entry {}", key);
        let flight = FlightGuard {
            cache: self.clone(),
            key,
            armed: true,
        };
        tokio::spawn(async move {
            match fetcher().await {
                Ok(value) => {
                    flight.complete(value);
                }
                Err(e) => {
                    tracing::warn!("Background refetch of {} failed: {}", flight.key, e);
                }
            }
        });
    }

    fn begin_fetch(&self, key: CacheKey) -> FlightGuard {
        self.write().in_flight.entry(key.clone()).or_default().count += 1;
        FlightGuard {
            cache: self.clone(),
            key,
            armed: true,
        }
    }

    fn supersede_fetch(state: &mut State, key: &CacheKey) {
        if let Some(flight) = state.in_flight.get_mut(key) {
            flight.superseded = true;
        }
    }

    /// Ends one in-flight fetch. Returns the `(invalidated, superseded)`
    /// flags raised while it ran.
    fn end_fetch(state: &mut State, key: &CacheKey) -> (bool, bool) {
        let (flags, done) = match state.in_flight.get_mut(key) {
            Some(flight) => {
                flight.count = flight.count.saturating_sub(1);
                ((flight.invalidated, flight.superseded), flight.count == 0)
            }
            None => ((false, false), false),
        };
        if done {
            state.in_flight.remove(key);
        }
        flags
    }

    fn complete_fetch(&self, key: &CacheKey, value: Value) -> Arc<Value> {
        let value = Arc::new(value);
        let stored = {
            let mut state = self.write();
            let (invalidated, superseded) = Self::end_fetch(&mut state, key);
            match state.entries.get_mut(key) {
                Some(entry) if superseded => {
                    tracing::debug!("{} was written during fetch; dropping the response", key);
                    entry.invalidated = true;
                    Arc::clone(&entry.value)
                }
                _ => {
                    if invalidated {
                        tracing::debug!("{} was invalidated during fetch; keeping it stale", key);
                    }
                    state.entries.insert(
                        key.clone(),
                        Entry {
                            value: Arc::clone(&value),
                            fetched_at: Instant::now(),
                            invalidated: invalidated || superseded,
                        },
                    );
                    value
                }
            }
        };
        self.notify(CacheChange::Updated(key.clone()));
        stored
    }

    fn abandon_fetch(&self, key: &CacheKey) {
        let mut state = self.write();
        Self::end_fetch(&mut state, key);
    }
}

/// One in-flight registration. Released on drop unless completed.
struct FlightGuard {
    cache: QueryCache,
    key: CacheKey,
    armed: bool,
}

impl FlightGuard {
    fn complete(mut self, value: Value) -> Arc<Value> {
        self.armed = false;
        self.cache.complete_fetch(&self.key, value)
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.armed {
            self.cache.abandon_fetch(&self.key);
        }
    }
}

fn merge_values(base: &Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged = base.clone();
            merged.extend(patch);
            Value::Object(merged)
        }
        (_, patch) => patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryParams;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(id: &str) -> CacheKey {
        CacheKey::entity(EntityKind::Jobs, id)
    }

    #[test]
    fn test_merge_overlays_fields() {
        let cache = QueryCache::new();
        cache.set(job("j1"), json!({"id": "j1", "status": "queued", "progress": 0}));

        let before = cache.get(&job("j1")).unwrap().value;
        assert!(cache.merge(job("j1"), json!({"status": "running", "progress": 40})));

        let after = cache.get(&job("j1")).unwrap();
        assert_eq!(*after.value, json!({"id": "j1", "status": "running", "progress": 40}));
        assert!(!after.stale);
        // Earlier snapshot is untouched.
        assert_eq!(before["status"], "queued");
    }

    #[test]
    fn test_merge_into_missing_entry_is_stale() {
        let cache = QueryCache::new();
        assert!(!cache.merge(job("j9"), json!({"id": "j9", "status": "running"})));
        let cached = cache.get(&job("j9")).unwrap();
        assert!(cached.stale);
        assert_eq!(cached.value["status"], "running");
    }

    #[test]
    fn test_invalidate_matching_collections_only() {
        let cache = QueryCache::new();
        let all = CacheKey::collection(EntityKind::Jobs, QueryParams::new());
        let running = CacheKey::collection(
            EntityKind::Jobs,
            QueryParams::new().with("status", "running"),
        );
        let assets = CacheKey::collection(EntityKind::Assets, QueryParams::new());
        cache.set(all.clone(), json!([]));
        cache.set(running.clone(), json!([]));
        cache.set(assets.clone(), json!([]));
        cache.set(job("j1"), json!({"id": "j1"}));

        assert_eq!(cache.invalidate_matching(&KeyFilter::Collections(EntityKind::Jobs)), 2);
        assert!(cache.get(&all).unwrap().stale);
        assert!(cache.get(&running).unwrap().stale);
        assert!(!cache.get(&assets).unwrap().stale);
        assert!(!cache.get(&job("j1")).unwrap().stale);
    }

    #[test]
    fn test_change_feed() {
        let cache = QueryCache::new();
        let mut rx = cache.subscribe();
        cache.set(job("j1"), json!({"id": "j1"}));
        cache.invalidate(&job("j1"));
        cache.remove(&job("j1"));
        assert!(!cache.remove(&job("j1")));

        assert_eq!(rx.try_recv().unwrap(), CacheChange::Updated(job("j1")));
        assert_eq!(rx.try_recv().unwrap(), CacheChange::Invalidated(job("j1")));
        assert_eq!(rx.try_recv().unwrap(), CacheChange::Removed(job("j1")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_age_based_staleness() {
        let policy = StalenessPolicy::default().with_max_age(EntityKind::Jobs, Duration::ZERO);
        let cache = QueryCache::with_policy(policy);
        cache.set(job("j1"), json!({"id": "j1"}));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get(&job("j1")).unwrap().stale);
    }

    #[tokio::test]
    async fn test_fetch_cold_then_fresh() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(json!({"id": "j1"}))
            }
        };

        let first = cache.fetch(job("j1"), fetcher.clone()).await.unwrap();
        let second = cache.fetch(job("j1"), fetcher).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_read_returns_value_and_refetches_once() {
        let cache = QueryCache::new();
        cache.set(job("j1"), json!({"id": "j1", "status": "queued"}));
        cache.invalidate(&job("j1"));

        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let counter = Arc::clone(&calls);
        let fetcher = move || {
            let counter = Arc::clone(&counter);
            let mut release = release_rx.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = release.wait_for(|go| *go).await;
                Ok::<_, String>(json!({"id": "j1", "status": "running"}))
            }
        };

        let a = cache.fetch(job("j1"), fetcher.clone()).await.unwrap();
        let b = cache.fetch(job("j1"), fetcher).await.unwrap();
        assert_eq!(a["status"], "queued");
        assert_eq!(b["status"], "queued");
        assert!(cache.is_fetching(&job("j1")));

        let mut rx = cache.subscribe();
        release_tx.send(true).unwrap();
        assert_eq!(rx.recv().await.unwrap(), CacheChange::Updated(job("j1")));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let fresh = cache.get(&job("j1")).unwrap();
        assert!(!fresh.stale);
        assert_eq!(fresh.value["status"], "running");
    }

    #[tokio::test]
    async fn test_invalidation_during_fetch_keeps_result_stale() {
        let cache = QueryCache::new();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let task_cache = cache.clone();
        let task = tokio::spawn(async move {
            task_cache
                .refresh(job("j1"), async move {
                    let _ = release_rx.await;
                    Ok::<_, String>(json!({"id": "j1", "status": "queued"}))
                })
                .await
        });

        while !cache.is_fetching(&job("j1")) {
            tokio::task::yield_now().await;
        }
        cache.invalidate_matching(&KeyFilter::Kind(EntityKind::Jobs));
        release_tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        assert!(cache.get(&job("j1")).unwrap().stale);
        assert!(!cache.is_fetching(&job("j1")));
    }

    #[tokio::test]
    async fn test_merge_during_fetch_wins_over_response() {
        let cache = QueryCache::new();
        cache.set(job("j1"), json!({"id": "j1", "status": "queued"}));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let task_cache = cache.clone();
        let task = tokio::spawn(async move {
            task_cache
                .refresh(job("j1"), async move {
                    let _ = release_rx.await;
                    Ok::<_, String>(json!({"id": "j1", "status": "running"}))
                })
                .await
        });

        while !cache.is_fetching(&job("j1")) {
            tokio::task::yield_now().await;
        }
        cache.merge(job("j1"), json!({"status": "completed"}));
        release_tx.send(()).unwrap();
        let returned = task.await.unwrap().unwrap();

        let cached = cache.get(&job("j1")).unwrap();
        assert_eq!(cached.value["status"], "completed");
        assert_eq!(returned["status"], "completed");
        assert!(cached.stale);
        assert!(!cache.is_fetching(&job("j1")));
    }

    #[tokio::test]
    async fn test_dropped_refresh_releases_key() {
        let cache = QueryCache::new();
        cache.set(job("j1"), json!({"id": "j1", "status": "queued"}));

        let pending = cache.refresh(job("j1"), std::future::pending::<Result<Value, String>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert!(!cache.is_fetching(&job("j1")));

        cache.invalidate(&job("j1"));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(json!({"id": "j1", "status": "running"}))
            }
        };

        let mut rx = cache.subscribe();
        let stale = cache.fetch(job("j1"), fetcher).await.unwrap();
        assert_eq!(stale["status"], "queued");
        assert_eq!(rx.recv().await.unwrap(), CacheChange::Updated(job("j1")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.get(&job("j1")).unwrap().stale);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_value() {
        let cache = QueryCache::new();
        cache.set(job("j1"), json!({"id": "j1", "status": "queued"}));

        let result = cache
            .refresh(job("j1"), async { Err::<Value, _>("boom".to_string()) })
            .await;
        assert_eq!(result.unwrap_err(), "boom");
        assert_eq!(cache.get(&job("j1")).unwrap().value["status"], "queued");
        assert!(!cache.is_fetching(&job("j1")));
    }
}
