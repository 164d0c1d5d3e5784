//! Stale-while-revalidate accessor.
//!
//! [`SwrCache::read`] answers synchronously from the store and, when the entry
//! is missing or stale, starts (or joins) a background revalidation. The
//! returned [`ReadResult`] carries a handle to that revalidation so callers
//! that want the fresh value can await it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::runtime::Handle;
use tracing::{info, warn};

use super::config::CacheConfig;
use super::entry::{Change, Generation, KeyState};
use super::error::BoxError;
use super::inflight::{Deduplicator, Dispatch, FetchResult, PendingFetch};
use super::keys::{CacheKey, Resource};
use super::registry::{SubscriberRegistry, Subscription};
use super::store::CacheStore;

const METRIC_HIT: &str = "cabinet_cache_hit_total";
const METRIC_STALE: &str = "cabinet_cache_stale_total";
const METRIC_MISS: &str = "cabinet_cache_miss_total";

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Time-to-live for this call, instead of the configured default.
    pub stale_after: Option<Duration>,
}

impl ReadOptions {
    pub fn stale_after(stale_after: Duration) -> Self {
        Self {
            stale_after: Some(stale_after),
        }
    }
}

/// Snapshot returned by [`SwrCache::read`].
pub struct ReadResult<V> {
    /// Cached value, fresh or stale. `None` when nothing is cached yet.
    pub value: Option<Arc<V>>,
    /// A revalidation was started or joined by this read.
    pub is_loading: bool,
    /// `value` is past its time-to-live.
    pub is_stale: bool,
    /// The revalidation, when `is_loading`.
    pub refresh: Option<PendingFetch<V>>,
}

impl<V> ReadResult<V> {
    fn fresh(value: Arc<V>) -> Self {
        Self {
            value: Some(value),
            is_loading: false,
            is_stale: false,
            refresh: None,
        }
    }

    /// Await the revalidation if one is running, otherwise return the cached value.
    ///
    /// Returns `None` only when the cache held nothing and no fetch was started,
    /// which does not happen for results produced by [`SwrCache::read`].
    pub async fn settled(self) -> Option<FetchResult<V>> {
        match self.refresh {
            Some(refresh) => Some(refresh.await),
            None => self.value.map(Ok),
        }
    }
}

/// Client-side data cache with stale-while-revalidate reads.
///
/// Cloning is cheap; clones share the same store, fetch registry and
/// subscribers.
pub struct SwrCache<V> {
    config: Arc<CacheConfig>,
    store: Arc<CacheStore<V>>,
    inflight: Arc<Deduplicator<V>>,
}

impl<V> Clone for SwrCache<V> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<V> SwrCache<V>
where
    V: Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        let subscribers = Arc::new(SubscriberRegistry::new());
        let store = Arc::new(CacheStore::new(&config, subscribers));
        Self {
            config: Arc::new(config),
            store,
            inflight: Arc::new(Deduplicator::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore<V> {
        &self.store
    }

    pub fn inflight(&self) -> &Deduplicator<V> {
        &self.inflight
    }

    fn ttl(&self, options: ReadOptions) -> Duration {
        options
            .stale_after
            .unwrap_or_else(|| self.config.stale_after())
    }

    /// Return the cached value for `key` and revalidate it when needed.
    ///
    /// - fresh entry: returned as is, `fetch_fn` is not called;
    /// - stale entry: returned with `is_stale`, a revalidation is started or joined;
    /// - no entry: `value` is `None`, a fetch is started or joined.
    ///
    /// A started fetch is driven on the current Tokio runtime, so it completes
    /// even if the caller drops the result.
    pub fn read<F, Fut, E>(
        &self,
        key: impl Into<CacheKey>,
        fetch_fn: F,
        options: ReadOptions,
    ) -> ReadResult<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let key = key.into();
        let stale_after = self.ttl(options);
        let cached = if self.config.enabled {
            self.store.touch(&key)
        } else {
            None
        };

        match cached {
            Some(entry) if entry.is_fresh_within(stale_after) => {
                counter!(METRIC_HIT).increment(1);
                ReadResult::fresh(entry.value)
            }
            cached => {
                let is_stale = cached.is_some();
                counter!(if is_stale { METRIC_STALE } else { METRIC_MISS }).increment(1);
                let refresh = self.revalidate_with(&key, fetch_fn, stale_after);
                ReadResult {
                    value: cached.map(|entry| entry.value),
                    is_loading: true,
                    is_stale,
                    refresh: Some(refresh),
                }
            }
        }
    }

    /// Warm `key` ahead of a read.
    ///
    /// Does nothing and returns `None` when the entry is fresh or a fetch for
    /// `key` is already in flight.
    pub fn prefetch<F, Fut, E>(
        &self,
        key: impl Into<CacheKey>,
        fetch_fn: F,
        options: ReadOptions,
    ) -> Option<PendingFetch<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let key = key.into();
        let stale_after = self.ttl(options);
        if self.inflight.is_pending(&key)
            || (self.config.enabled && self.store.is_fresh(&key, stale_after))
        {
            return None;
        }
        Some(self.revalidate_with(&key, fetch_fn, stale_after))
    }

    /// Start or join a fetch for `key` regardless of freshness.
    pub fn revalidate<F, Fut, E>(
        &self,
        key: impl Into<CacheKey>,
        fetch_fn: F,
        options: ReadOptions,
    ) -> PendingFetch<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let key = key.into();
        let stale_after = self.ttl(options);
        self.revalidate_with(&key, fetch_fn, stale_after)
    }

    fn revalidate_with<F, Fut, E>(
        &self,
        key: &CacheKey,
        fetch_fn: F,
        stale_after: Duration,
    ) -> PendingFetch<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let store = Arc::clone(&self.store);
        let enabled = self.config.enabled;
        let settled_key = key.clone();

        match self.inflight.dispatch(
            key,
            || self.store.begin(key),
            fetch_fn,
            move |generation, result| match result {
                Some(Ok(value)) if enabled => {
                    store.apply(&settled_key, generation, Arc::clone(value), stale_after);
                }
                _ => store.release(&settled_key, generation),
            },
        ) {
            Dispatch::Started(pending) => {
                drive(&pending);
                pending
            }
            Dispatch::Joined(pending) => pending,
        }
    }

    /// Cached value for `key`, fresh or stale, without starting a fetch.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        self.store.get(key).map(|entry| entry.value)
    }

    /// Replace the cached value for `key` directly, as after a local mutation.
    ///
    /// Fetches already in flight for `key` will not overwrite this value.
    /// Returns `None` when the cache is disabled.
    pub fn set(&self, key: impl Into<CacheKey>, value: V, options: ReadOptions) -> Option<Generation> {
        if !self.config.enabled {
            return None;
        }
        let stale_after = self.ttl(options);
        Some(self.store.set(key.into(), Arc::new(value), stale_after))
    }

    /// Replace the cached value for `key` with `update(current)`.
    ///
    /// Returns `false` without writing when nothing is cached for `key`.
    pub fn mutate<U>(&self, key: impl Into<CacheKey>, update: U, options: ReadOptions) -> bool
    where
        U: FnOnce(&V) -> V,
    {
        let key = key.into();
        let Some(current) = self.get(&key) else {
            return false;
        };
        self.set(key, update(&current), options).is_some()
    }

    /// Observable state of `key`.
    pub fn state(&self, key: &CacheKey) -> KeyState {
        let loading = self.inflight.is_pending(key);
        match self.store.get(key) {
            Some(entry) if entry.is_fresh() => KeyState::Fresh,
            _ if loading => KeyState::Loading,
            Some(_) => KeyState::Stale,
            None => KeyState::Absent,
        }
    }

    /// Remove the entry for `key` and forget any fetch in flight for it.
    ///
    /// The next read starts a new fetch. The forgotten fetch still completes
    /// for callers already awaiting it, but its result is not stored.
    /// Subscribers of `key` are notified even when nothing was cached, once the
    /// fetch is forgotten, so reading from the callback starts a new fetch.
    pub fn invalidate_key(&self, key: &CacheKey) -> bool {
        let removed = self.store.remove(key);
        self.inflight.detach(key);
        self.store.notify_all(std::slice::from_ref(key), &Change::Invalidated);
        removed
    }

    /// Invalidate every key equal to `prefix` or extending it by whole segments.
    ///
    /// Returns the number of cached entries removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let matches = |key: &CacheKey| key.has_prefix(prefix);
        for key in self.inflight.keys().iter().filter(|key| matches(*key)) {
            self.store.supersede(key);
        }
        let removed = self.store.remove_matching(matches);
        let detached = self.inflight.detach_matching(matches);
        self.store.notify_all(&removed, &Change::Invalidated);
        info!(prefix, removed = removed.len(), detached, "Invalidated cache prefix");
        removed.len()
    }

    /// Invalidate every key belonging to `resource`.
    pub fn invalidate_resource(&self, resource: Resource) -> usize {
        self.invalidate_prefix(resource.as_str())
    }

    /// Remove every entry and forget every fetch in flight.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_all(&self) -> usize {
        let removed = self.store.reset();
        let detached = self.inflight.len();
        self.inflight.detach_all();
        self.store.notify_all(&removed, &Change::Cleared);
        info!(removed = removed.len(), detached, "Cleared cache");
        removed.len()
    }

    /// Register `callback` for every change to `key`.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<C>(&self, key: impl Into<CacheKey>, callback: C) -> Subscription<V>
    where
        C: Fn(&CacheKey, &Change<V>) + Send + Sync + 'static,
    {
        self.store.subscribers().subscribe(key.into(), callback)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

fn drive<V>(pending: &PendingFetch<V>)
where
    V: Send + Sync + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            let pending = pending.clone();
            handle.spawn(async move {
                let _ = pending.await;
            });
        }
        Err(_) => warn!(
            cache_key = %pending.key(),
            "No Tokio runtime; fetch progresses only while awaited"
        ),
    }
}
