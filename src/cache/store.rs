//! Cache storage.
//!
//! Holds the latest value per key together with the per-key generation guard.
//! Entries and generations share one lock so that "is this fetch still the
//! latest?" and "store its value" happen atomically. Subscribers are notified
//! after the lock is released.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::debug;

use super::config::CacheConfig;
use super::entry::{CacheEntry, Change, Generation};
use super::keys::CacheKey;
use super::lock::mutex_lock;
use super::registry::SubscriberRegistry;

const SOURCE: &str = "cache::store";
const METRIC_EVICT: &str = "cabinet_cache_evict_total";
const METRIC_DISCARDED: &str = "cabinet_cache_discarded_total";

/// Generation bookkeeping for a key with fetches outstanding.
struct Guard {
    /// Latest generation dispatched or written.
    latest: Generation,
    /// Fetches dispatched and not yet settled, registered or detached.
    outstanding: usize,
}

struct StoreState<V> {
    entries: LruCache<CacheKey, CacheEntry<V>>,
    /// Only keys with outstanding fetches have a guard; any other key has no
    /// older fetch left that could overwrite it.
    guards: HashMap<CacheKey, Guard>,
    /// Every generation at or below this was superseded by `clear`.
    floor: Generation,
    counter: Generation,
}

impl<V> StoreState<V> {
    fn advance(&mut self, key: &CacheKey) -> Generation {
        self.counter += 1;
        if let Some(guard) = self.guards.get_mut(key) {
            guard.latest = self.counter;
        }
        self.counter
    }

    fn begin(&mut self, key: &CacheKey) -> Generation {
        self.counter += 1;
        let generation = self.counter;
        self.guards
            .entry(key.clone())
            .and_modify(|guard| {
                guard.latest = generation;
                guard.outstanding += 1;
            })
            .or_insert(Guard {
                latest: generation,
                outstanding: 1,
            });
        generation
    }

    fn is_latest(&self, key: &CacheKey, generation: Generation) -> bool {
        generation > self.floor
            && self
                .guards
                .get(key)
                .is_none_or(|guard| generation >= guard.latest)
    }

    /// Settle one outstanding fetch, dropping the guard with the last one.
    fn release(&mut self, key: &CacheKey, generation: Generation) {
        // Guards of fetches dispatched before a clear were dropped by it.
        if generation <= self.floor {
            return;
        }
        if let Entry::Occupied(mut guard) = self.guards.entry(key.clone()) {
            let remaining = guard.get().outstanding.saturating_sub(1);
            if remaining == 0 {
                guard.remove();
            } else {
                guard.get_mut().outstanding = remaining;
            }
        }
    }

    /// Insert, returning the key evicted to make room (never `key` itself).
    fn insert(&mut self, key: CacheKey, entry: CacheEntry<V>) -> Option<CacheKey> {
        match self.entries.push(key.clone(), entry) {
            Some((evicted, _)) if evicted != key => Some(evicted),
            _ => None,
        }
    }
}

/// Key/value store of the latest known value per key.
pub struct CacheStore<V> {
    state: Mutex<StoreState<V>>,
    subscribers: Arc<SubscriberRegistry<V>>,
}

impl<V> CacheStore<V> {
    /// Create a new store with the given configuration.
    pub fn new(config: &CacheConfig, subscribers: Arc<SubscriberRegistry<V>>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                entries: LruCache::new(config.max_entries_non_zero()),
                guards: HashMap::new(),
                floor: 0,
                counter: 0,
            }),
            subscribers,
        }
    }

    pub fn subscribers(&self) -> &Arc<SubscriberRegistry<V>> {
        &self.subscribers
    }

    /// Current entry for `key`, without touching its recency.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        mutex_lock(&self.state, SOURCE, "get")
            .entries
            .peek(key)
            .cloned()
    }

    /// Current entry for `key`, marking it as recently used.
    pub(crate) fn touch(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        mutex_lock(&self.state, SOURCE, "touch")
            .entries
            .get(key)
            .cloned()
    }

    /// `now - fetched_at < stale_after` for the entry of `key`; false when absent.
    pub fn is_fresh(&self, key: &CacheKey, stale_after: Duration) -> bool {
        self.get(key)
            .is_some_and(|entry| entry.is_fresh_within(stale_after))
    }

    /// Replace the entry for `key` with a value fetched now.
    ///
    /// Advances the key's generation, so fetches already in flight for the key
    /// will not overwrite this value when they settle.
    pub fn set(&self, key: CacheKey, value: Arc<V>, stale_after: Duration) -> Generation {
        self.set_at(key, value, Instant::now(), stale_after)
    }

    /// Replace the entry for `key` with a value fetched at `fetched_at`.
    pub fn set_at(
        &self,
        key: CacheKey,
        value: Arc<V>,
        fetched_at: Instant,
        stale_after: Duration,
    ) -> Generation {
        let (generation, evicted) = {
            let mut state = mutex_lock(&self.state, SOURCE, "set");
            let generation = state.advance(&key);
            let evicted = state.insert(
                key.clone(),
                entry(Arc::clone(&value), fetched_at, stale_after, generation),
            );
            (generation, evicted)
        };

        self.after_write(&key, value, evicted);
        generation
    }

    /// Reserve a generation for a fetch of `key` that is about to start.
    ///
    /// Every generation handed out here must later be passed to [`Self::apply`]
    /// or [`Self::release`].
    pub fn begin(&self, key: &CacheKey) -> Generation {
        mutex_lock(&self.state, SOURCE, "begin").begin(key)
    }

    /// Settle the fetch tagged `generation` without storing anything, as after
    /// a failure.
    pub fn release(&self, key: &CacheKey, generation: Generation) {
        mutex_lock(&self.state, SOURCE, "release").release(key, generation);
    }

    /// Mark every fetch dispatched so far for `key` as superseded.
    pub fn supersede(&self, key: &CacheKey) -> Generation {
        mutex_lock(&self.state, SOURCE, "supersede").advance(key)
    }

    /// Store the result of the fetch tagged `generation`, unless a newer fetch,
    /// write, invalidation or clear happened for `key` since it was dispatched.
    ///
    /// Settles the fetch either way. Returns whether the value was stored.
    pub fn apply(
        &self,
        key: &CacheKey,
        generation: Generation,
        value: Arc<V>,
        stale_after: Duration,
    ) -> bool {
        let evicted = {
            let mut state = mutex_lock(&self.state, SOURCE, "apply");
            let latest = state.is_latest(key, generation);
            state.release(key, generation);
            if !latest {
                drop(state);
                debug!(cache_key = %key, generation, "Discarding superseded fetch result");
                counter!(METRIC_DISCARDED).increment(1);
                return false;
            }
            state.insert(
                key.clone(),
                entry(Arc::clone(&value), Instant::now(), stale_after, generation),
            )
        };

        self.after_write(key, value, evicted);
        true
    }

    /// Remove the entry for `key` and notify its subscribers. Fetches in
    /// flight for `key` are superseded.
    ///
    /// Returns whether an entry was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.remove(key);
        self.notify_all(std::slice::from_ref(key), &Change::Invalidated);
        removed
    }

    /// Remove every entry whose key satisfies `predicate`.
    ///
    /// Returns the removed keys.
    pub fn invalidate_matching<P>(&self, predicate: P) -> Vec<CacheKey>
    where
        P: Fn(&CacheKey) -> bool,
    {
        let removed = self.remove_matching(predicate);
        self.notify_all(&removed, &Change::Invalidated);
        removed
    }

    /// Remove all entries and supersede every fetch in flight.
    ///
    /// Returns the number of entries removed.
    pub fn clear(&self) -> usize {
        let removed = self.reset();
        self.notify_all(&removed, &Change::Cleared);
        removed.len()
    }

    /// [`Self::invalidate`] without notifying.
    pub(crate) fn remove(&self, key: &CacheKey) -> bool {
        let mut state = mutex_lock(&self.state, SOURCE, "invalidate");
        state.advance(key);
        state.entries.pop(key).is_some()
    }

    /// [`Self::invalidate_matching`] without notifying.
    pub(crate) fn remove_matching<P>(&self, predicate: P) -> Vec<CacheKey>
    where
        P: Fn(&CacheKey) -> bool,
    {
        let mut state = mutex_lock(&self.state, SOURCE, "invalidate_matching");
        let matching: Vec<CacheKey> = state
            .entries
            .iter()
            .map(|(key, _)| key)
            .filter(|key| predicate(*key))
            .cloned()
            .collect();
        for key in &matching {
            state.advance(key);
            state.entries.pop(key);
        }
        matching
    }

    /// [`Self::clear`] without notifying. Returns the removed keys.
    pub(crate) fn reset(&self) -> Vec<CacheKey> {
        let mut state = mutex_lock(&self.state, SOURCE, "clear");
        state.counter += 1;
        state.floor = state.counter;
        state.guards.clear();
        let keys = state.entries.iter().map(|(key, _)| key.clone()).collect();
        state.entries.clear();
        keys
    }

    pub(crate) fn notify_all(&self, keys: &[CacheKey], change: &Change<V>) {
        for key in keys {
            self.subscribers.notify(key, change);
        }
    }

    /// Keys currently held, most recently used first.
    pub fn keys(&self) -> Vec<CacheKey> {
        mutex_lock(&self.state, SOURCE, "keys")
            .entries
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Get the number of cached entries.
    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").entries.len()
    }

    /// Number of keys with fetches still outstanding.
    pub fn guarded_keys(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "guarded_keys").guards.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn after_write(&self, key: &CacheKey, value: Arc<V>, evicted: Option<CacheKey>) {
        if let Some(evicted) = evicted {
            counter!(METRIC_EVICT).increment(1);
            debug!(cache_key = %evicted, "Evicted least recently used cache entry");
            self.subscribers.notify(&evicted, &Change::Evicted);
        }
        self.subscribers.notify(key, &Change::Updated(value));
    }
}

fn entry<V>(
    value: Arc<V>,
    fetched_at: Instant,
    stale_after: Duration,
    generation: Generation,
) -> CacheEntry<V> {
    CacheEntry {
        value,
        fetched_at,
        stored_at: OffsetDateTime::now_utc(),
        stale_after,
        generation,
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const TTL: Duration = Duration::from_millis(1000);

    fn store_with(config: CacheConfig) -> CacheStore<Vec<u32>> {
        CacheStore::new(&config, Arc::new(SubscriberRegistry::new()))
    }

    fn store() -> CacheStore<Vec<u32>> {
        store_with(CacheConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_get_roundtrip_is_fresh() {
        let store = store();
        let key = CacheKey::from("releases:user42");

        assert!(store.get(&key).is_none());
        assert!(!store.is_fresh(&key, TTL));

        store.set(key.clone(), Arc::new(vec![1]), TTL);

        let cached = store.get(&key).expect("cached entry");
        assert_eq!(cached.value.as_slice(), &[1]);
        assert!(store.is_fresh(&key, TTL));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!store.is_fresh(&key, TTL));
        assert!(store.get(&key).is_some(), "stale entries are still served");
    }

    #[test]
    fn set_replaces_rather_than_merges() {
        let store = store();
        let key = CacheKey::from("tickets:unread");

        store.set(key.clone(), Arc::new(vec![1, 2]), TTL);
        store.set(key.clone(), Arc::new(vec![3]), TTL);

        assert_eq!(store.get(&key).expect("entry").value.as_slice(), &[3]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn invalidate_twice_equals_once() {
        let store = store();
        let key = CacheKey::from("payouts:user7");
        store.set(key.clone(), Arc::new(vec![9]), TTL);

        assert!(store.invalidate(&key));
        assert!(store.get(&key).is_none());
        assert!(!store.invalidate(&key));
        assert!(store.get(&key).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn newer_generation_wins_over_older_settle() {
        let store = store();
        let key = CacheKey::from("releases:user42");

        let g1 = store.begin(&key);
        let g2 = store.begin(&key);
        assert!(g2 > g1);

        assert!(store.apply(&key, g2, Arc::new(vec![2]), TTL));
        assert!(!store.apply(&key, g1, Arc::new(vec![1]), TTL));

        let entry = store.get(&key).expect("entry");
        assert_eq!(entry.value.as_slice(), &[2]);
        assert_eq!(entry.generation, g2);
    }

    #[test]
    fn invalidate_and_direct_set_supersede_in_flight_fetches() {
        let store = store();
        let key = CacheKey::from("news");

        let in_flight = store.begin(&key);
        store.invalidate(&key);
        assert!(!store.apply(&key, in_flight, Arc::new(vec![1]), TTL));
        assert!(store.get(&key).is_none());

        let in_flight = store.begin(&key);
        store.set(key.clone(), Arc::new(vec![5]), TTL);
        assert!(!store.apply(&key, in_flight, Arc::new(vec![1]), TTL));
        assert_eq!(store.get(&key).expect("entry").value.as_slice(), &[5]);
    }

    #[test]
    fn clear_supersedes_every_key() {
        let store = store();
        let a = CacheKey::from("news");
        let b = CacheKey::from("profiles:admin");

        store.set(a.clone(), Arc::new(vec![1]), TTL);
        let pending = store.begin(&b);

        assert_eq!(store.clear(), 1);
        assert!(store.is_empty());
        assert!(!store.apply(&b, pending, Arc::new(vec![2]), TTL));

        let fresh = store.begin(&b);
        assert!(store.apply(&b, fresh, Arc::new(vec![3]), TTL));
    }

    #[test]
    fn invalidate_matching_removes_only_matching_keys() {
        let store = store();
        store.set(CacheKey::from("releases:user1"), Arc::new(vec![1]), TTL);
        store.set(CacheKey::from("releases:user2"), Arc::new(vec![2]), TTL);
        store.set(CacheKey::from("tickets:unread"), Arc::new(vec![3]), TTL);

        let mut removed = store.invalidate_matching(|key| key.has_prefix("releases"));
        removed.sort();

        assert_eq!(
            removed,
            vec![CacheKey::from("releases:user1"), CacheKey::from("releases:user2")]
        );
        assert_eq!(store.keys(), vec![CacheKey::from("tickets:unread")]);
    }

    #[test]
    fn generation_guards_do_not_outlive_their_fetches() {
        let store = store_with(CacheConfig {
            max_entries: 2,
            ..Default::default()
        });

        for n in 0..1_000 {
            let key = CacheKey::from("releases").segment(format!("user{n}"));
            store.set(key.clone(), Arc::new(vec![n]), TTL);
            store.invalidate(&CacheKey::from("tickets").segment(format!("user{n}")));

            let ok = store.begin(&key);
            let failed = store.begin(&key);
            assert!(!store.apply(&key, ok, Arc::new(vec![n]), TTL));
            store.release(&key, failed);
        }

        assert_eq!(store.len(), 2);
        assert_eq!(store.guarded_keys(), 0);
    }

    #[test]
    fn guard_survives_until_the_last_outstanding_fetch_settles() {
        let store = store();
        let key = CacheKey::from("payouts:user7");

        let older = store.begin(&key);
        let newer = store.begin(&key);
        assert!(store.apply(&key, newer, Arc::new(vec![2]), TTL));
        assert_eq!(store.guarded_keys(), 1);

        assert!(!store.apply(&key, older, Arc::new(vec![1]), TTL));
        assert_eq!(store.guarded_keys(), 0);
        assert_eq!(store.get(&key).expect("entry").value.as_slice(), &[2]);
    }

    #[test]
    fn fetches_from_before_a_clear_leave_newer_guards_alone() {
        let store = store();
        let key = CacheKey::from("news");

        let before_clear = store.begin(&key);
        store.clear();
        let after_clear = store.begin(&key);
        store.set(key.clone(), Arc::new(vec![7]), TTL);

        store.release(&key, before_clear);
        assert_eq!(store.guarded_keys(), 1);
        assert!(!store.apply(&key, after_clear, Arc::new(vec![1]), TTL));
        assert_eq!(store.get(&key).expect("entry").value.as_slice(), &[7]);
        assert_eq!(store.guarded_keys(), 0);
    }

    #[test]
    fn lru_eviction_notifies_evicted_key() {
        let store = store_with(CacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        let evictions = Arc::new(AtomicUsize::new(0));
        let evictions_seen = Arc::clone(&evictions);
        let first = CacheKey::from("news:1");
        let _subscription = store.subscribers().subscribe(first.clone(), move |_key, change| {
            if matches!(change, Change::Evicted) {
                evictions_seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        store.set(first.clone(), Arc::new(vec![1]), TTL);
        store.set(CacheKey::from("news:2"), Arc::new(vec![2]), TTL);
        store.set(CacheKey::from("news:3"), Arc::new(vec![3]), TTL);

        assert!(store.get(&first).is_none());
        assert_eq!(store.len(), 2);
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriber_sees_updated_state() {
        let store = Arc::new(store());
        let key = CacheKey::from("tickets:unread");
        let observed = Arc::new(Mutex::new(None));

        let store_in_callback = Arc::clone(&store);
        let observed_in_callback = Arc::clone(&observed);
        let _subscription = store
            .subscribers()
            .subscribe(key.clone(), move |key, _change| {
                let value = store_in_callback.get(key).map(|entry| entry.value);
                *observed_in_callback.lock().expect("observed lock") = value;
            });

        store.set(key.clone(), Arc::new(vec![4, 2]), TTL);

        let observed = observed.lock().expect("observed lock").clone();
        assert_eq!(observed.as_deref().map(Vec::as_slice), Some(&[4, 2][..]));
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let store = store();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.state.lock().expect("state lock should be acquired");
            panic!("poison state lock");
        }));

        store.set(CacheKey::from("news"), Arc::new(vec![1]), TTL);
        assert!(store.get(&CacheKey::from("news")).is_some());
    }
}
