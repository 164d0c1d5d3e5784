//! Request de-duplication.
//!
//! At most one fetch per key is registered at a time. Callers arriving while a
//! fetch is registered join it and observe the same result or the same error.

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, histogram};
use tracing::{debug, warn};

use super::entry::Generation;
use super::error::{BoxError, FetchError};
use super::keys::CacheKey;

const METRIC_FETCH: &str = "cabinet_cache_fetch_total";
const METRIC_FETCH_JOINED: &str = "cabinet_cache_fetch_joined_total";
const METRIC_FETCH_MS: &str = "cabinet_cache_fetch_ms";

/// Outcome of a fetch, shared by every joined caller.
pub type FetchResult<V> = Result<Arc<V>, FetchError>;

type SharedFetch<V> = Shared<BoxFuture<'static, FetchResult<V>>>;

/// Handle to an in-flight fetch. Awaiting it yields the shared result.
pub struct PendingFetch<V> {
    key: CacheKey,
    generation: Generation,
    shared: SharedFetch<V>,
}

impl<V> PendingFetch<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }
}

impl<V> Clone for PendingFetch<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            generation: self.generation,
            shared: self.shared.clone(),
        }
    }
}

impl<V> Future for PendingFetch<V> {
    type Output = FetchResult<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().shared).poll(cx)
    }
}

/// Whether a dispatch started a new fetch or joined a registered one.
pub enum Dispatch<V> {
    Started(PendingFetch<V>),
    Joined(PendingFetch<V>),
}

impl<V> Dispatch<V> {
    pub fn is_started(&self) -> bool {
        matches!(self, Dispatch::Started(_))
    }

    pub fn into_pending(self) -> PendingFetch<V> {
        match self {
            Dispatch::Started(pending) | Dispatch::Joined(pending) => pending,
        }
    }
}

/// Registry of in-flight fetches, one per key.
pub struct Deduplicator<V> {
    pending: Arc<DashMap<CacheKey, PendingFetch<V>>>,
}

impl<V> Deduplicator<V>
where
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Join the fetch registered for `key`, or start `fetch_fn` and register it.
    ///
    /// When starting, `begin` is called once to tag the fetch with a generation.
    /// `on_settle` runs exactly once when the fetch settles, before the
    /// registration is removed, so a caller checking the store right after
    /// settlement never sees neither the value nor a pending fetch. If every
    /// handle is dropped before the fetch settles, `on_settle` runs with `None`.
    ///
    /// The fetch is lazy: it makes progress only while some clone of the
    /// returned handle is polled.
    pub fn dispatch<F, Fut, E, B, S>(
        &self,
        key: &CacheKey,
        begin: B,
        fetch_fn: F,
        on_settle: S,
    ) -> Dispatch<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
        B: FnOnce() -> Generation,
        S: FnOnce(Generation, Option<&FetchResult<V>>) + Send + 'static,
    {
        match self.pending.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let pending = occupied.get().clone();
                counter!(METRIC_FETCH_JOINED).increment(1);
                debug!(
                    cache_key = %key,
                    generation = pending.generation,
                    "Joining in-flight fetch"
                );
                Dispatch::Joined(pending)
            }
            Entry::Vacant(vacant) => {
                let generation = begin();
                debug!(cache_key = %key, generation, "Starting fetch");
                let shared = settle(
                    key.clone(),
                    generation,
                    fetch_fn,
                    on_settle,
                    Arc::downgrade(&self.pending),
                )
                .shared();
                let pending = PendingFetch {
                    key: key.clone(),
                    generation,
                    shared,
                };
                vacant.insert(pending.clone());
                Dispatch::Started(pending)
            }
        }
    }

    /// Fetch `key` through the de-duplicator and wait for the shared result.
    pub async fn fetch<F, Fut, E, B>(&self, key: &CacheKey, begin: B, fetch_fn: F) -> FetchResult<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
        B: FnOnce() -> Generation,
    {
        self.dispatch(key, begin, fetch_fn, |_, _| {})
            .into_pending()
            .await
    }

    /// The fetch currently registered for `key`.
    pub fn pending(&self, key: &CacheKey) -> Option<PendingFetch<V>> {
        self.pending.get(key).map(|pending| pending.clone())
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Unregister the fetch for `key` without cancelling it, so the next
    /// dispatch starts a new one. Returns whether a fetch was registered.
    pub fn detach(&self, key: &CacheKey) -> bool {
        self.pending.remove(key).is_some()
    }

    /// Keys with a registered fetch.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.pending.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Unregister every fetch whose key satisfies `predicate`.
    pub fn detach_matching<P>(&self, predicate: P) -> usize
    where
        P: Fn(&CacheKey) -> bool,
    {
        let before = self.pending.len();
        self.pending.retain(|key, _| !predicate(key));
        before.saturating_sub(self.pending.len())
    }

    /// Unregister every fetch.
    pub fn detach_all(&self) {
        self.pending.clear();
    }

    /// Number of registered fetches.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<V> Default for Deduplicator<V>
where
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Settle hook that still runs, with `None`, when the fetch is dropped unsettled.
struct SettleHook<V, S>
where
    S: FnOnce(Generation, Option<&FetchResult<V>>),
{
    generation: Generation,
    hook: Option<S>,
    _result: PhantomData<fn() -> V>,
}

impl<V, S> SettleHook<V, S>
where
    S: FnOnce(Generation, Option<&FetchResult<V>>),
{
    fn run(mut self, result: &FetchResult<V>) {
        if let Some(hook) = self.hook.take() {
            hook(self.generation, Some(result));
        }
    }
}

impl<V, S> Drop for SettleHook<V, S>
where
    S: FnOnce(Generation, Option<&FetchResult<V>>),
{
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            debug!(generation = self.generation, "Fetch dropped before settling");
            hook(self.generation, None);
        }
    }
}

fn settle<V, F, Fut, E, S>(
    key: CacheKey,
    generation: Generation,
    fetch_fn: F,
    on_settle: S,
    registry: Weak<DashMap<CacheKey, PendingFetch<V>>>,
) -> BoxFuture<'static, FetchResult<V>>
where
    V: Send + Sync + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
    S: FnOnce(Generation, Option<&FetchResult<V>>) + Send + 'static,
{
    let hook = SettleHook {
        generation,
        hook: Some(on_settle),
        _result: PhantomData,
    };
    async move {
        let started_at = Instant::now();
        let outcome = AssertUnwindSafe(async move { fetch_fn().await })
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(value)) => Ok(Arc::new(value)),
            Ok(Err(error)) => Err(FetchError::new(key.clone(), error)),
            Err(payload) => Err(FetchError::panicked(key.clone(), payload.as_ref())),
        };

        let outcome_label = match &result {
            Ok(_) => "ok",
            Err(error) if error.is_panic() => "panic",
            Err(_) => "error",
        };
        counter!(METRIC_FETCH, "outcome" => outcome_label).increment(1);
        histogram!(METRIC_FETCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        if let Err(error) = &result {
            warn!(cache_key = %key, generation, error = %error, "Cache fetch failed");
        }

        hook.run(&result);
        if let Some(registry) = registry.upgrade() {
            registry.remove_if(&key, |_, current| current.generation == generation);
        }

        result
    }
    .boxed()
}
