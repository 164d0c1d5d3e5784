//! Subscriber registry.
//!
//! Maps cache keys to the callbacks interested in them and fans out change
//! notifications. Callbacks run outside the registry lock, over a snapshot of
//! the subscriber list, so a callback may subscribe or unsubscribe freely.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use metrics::counter;
use tracing::error;

use super::entry::Change;
use super::error::panic_message;
use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";
const METRIC_SUBSCRIBER_PANIC: &str = "cabinet_cache_subscriber_panic_total";

type Callback<V> = Arc<dyn Fn(&CacheKey, &Change<V>) + Send + Sync>;

struct Slot<V> {
    id: u64,
    callback: Callback<V>,
}

struct RegistryInner<V> {
    /// Subscribers per key, in registration order.
    subscribers: RwLock<HashMap<CacheKey, Vec<Slot<V>>>>,
    next_id: AtomicU64,
}

impl<V> RegistryInner<V> {
    fn remove(&self, key: &CacheKey, id: u64) -> bool {
        let mut subscribers = rw_write(&self.subscribers, SOURCE, "unsubscribe");
        let Some(slots) = subscribers.get_mut(key) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        let removed = slots.len() != before;
        if slots.is_empty() {
            subscribers.remove(key);
        }
        removed
    }
}

/// Per-key observer list.
pub struct SubscriberRegistry<V> {
    inner: Arc<RegistryInner<V>>,
}

impl<V> SubscriberRegistry<V> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` for changes to `key`.
    ///
    /// The callback stays registered until the returned handle is dropped or
    /// [`Subscription::unsubscribe`] is called.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, key: CacheKey, callback: F) -> Subscription<V>
    where
        F: Fn(&CacheKey, &Change<V>) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        rw_write(&self.inner.subscribers, SOURCE, "subscribe")
            .entry(key.clone())
            .or_default()
            .push(Slot {
                id,
                callback: Arc::new(callback),
            });

        Subscription {
            key,
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Invoke every callback registered for `key`, in registration order.
    ///
    /// A panicking callback is logged and skipped; the remaining callbacks
    /// still run. Returns the number of callbacks that completed normally.
    pub fn notify(&self, key: &CacheKey, change: &Change<V>) -> usize {
        let snapshot: Vec<Callback<V>> = {
            let subscribers = rw_read(&self.inner.subscribers, SOURCE, "notify");
            match subscribers.get(key) {
                Some(slots) => slots.iter().map(|slot| Arc::clone(&slot.callback)).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for callback in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(key, change))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    error!(
                        cache_key = %key,
                        change = change.kind(),
                        panic = panic_message(payload.as_ref()),
                        "Cache subscriber panicked during notification"
                    );
                    counter!(METRIC_SUBSCRIBER_PANIC).increment(1);
                }
            }
        }
        delivered
    }

    /// Keys that currently have at least one subscriber.
    pub fn keys(&self) -> Vec<CacheKey> {
        rw_read(&self.inner.subscribers, SOURCE, "keys")
            .keys()
            .cloned()
            .collect()
    }

    /// Number of subscribers registered for `key`.
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        rw_read(&self.inner.subscribers, SOURCE, "subscriber_count")
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Number of keys with subscribers.
    pub fn key_count(&self) -> usize {
        rw_read(&self.inner.subscribers, SOURCE, "key_count").len()
    }
}

impl<V> Default for SubscriberRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Deregistration handle returned by [`SubscriberRegistry::subscribe`].
///
/// Holds only a weak reference to the registry; dropping it unsubscribes.
pub struct Subscription<V> {
    key: CacheKey,
    id: u64,
    registry: Weak<RegistryInner<V>>,
}

impl<V> Subscription<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Unsubscribe now. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<V> Drop for Subscription<V> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key, self.id);
        }
    }
}

impl<V> fmt::Debug for Subscription<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&CacheKey, &Change<u32>) + Send + Sync>)
    {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_factory = Arc::clone(&log);
        let factory = move |name: &str| {
            let log = Arc::clone(&log_for_factory);
            let name = name.to_string();
            Box::new(move |_key: &CacheKey, change: &Change<u32>| {
                log.lock()
                    .expect("log lock")
                    .push(format!("{name}:{}", change.kind()));
            }) as Box<dyn Fn(&CacheKey, &Change<u32>) + Send + Sync>
        };
        (log, factory)
    }

    #[test]
    fn notifies_in_registration_order() {
        let registry = SubscriberRegistry::<u32>::new();
        let (log, make) = recorder();
        let key = CacheKey::from("tickets:unread");

        let _a = registry.subscribe(key.clone(), make("a"));
        let _b = registry.subscribe(key.clone(), make("b"));
        let _other = registry.subscribe(CacheKey::from("news"), make("other"));

        let delivered = registry.notify(&key, &Change::Updated(Arc::new(1)));
        assert_eq!(delivered, 2);
        assert_eq!(
            log.lock().expect("log lock").as_slice(),
            &["a:updated".to_string(), "b:updated".to_string()]
        );
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let registry = SubscriberRegistry::<u32>::new();
        let (log, make) = recorder();
        let key = CacheKey::from("payouts");

        let subscription = registry.subscribe(key.clone(), make("a"));
        assert_eq!(registry.subscriber_count(&key), 1);

        subscription.unsubscribe();
        assert_eq!(registry.subscriber_count(&key), 0);
        assert_eq!(registry.key_count(), 0);

        assert_eq!(registry.notify(&key, &Change::Invalidated), 0);
        assert!(log.lock().expect("log lock").is_empty());
    }

    #[test]
    fn panicking_subscriber_does_not_stop_others() {
        let registry = SubscriberRegistry::<u32>::new();
        let (log, make) = recorder();
        let key = CacheKey::from("releases:user42");

        let _a = registry.subscribe(key.clone(), make("a"));
        let _boom = registry.subscribe(key.clone(), |_key: &CacheKey, _change: &Change<u32>| {
            panic!("subscriber failure");
        });
        let _c = registry.subscribe(key.clone(), make("c"));

        let delivered = registry.notify(&key, &Change::Updated(Arc::new(5)));
        assert_eq!(delivered, 2);
        assert_eq!(
            log.lock().expect("log lock").as_slice(),
            &["a:updated".to_string(), "c:updated".to_string()]
        );
        assert_eq!(registry.subscriber_count(&key), 3);
    }

    #[test]
    fn callback_may_unsubscribe_during_notify() {
        let registry = Arc::new(SubscriberRegistry::<u32>::new());
        let key = CacheKey::from("news");
        let slot: Arc<Mutex<Option<Subscription<u32>>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));

        let slot_in_callback = Arc::clone(&slot);
        let calls_in_callback = Arc::clone(&calls);
        let subscription = registry.subscribe(key.clone(), move |_key, _change| {
            calls_in_callback.fetch_add(1, Ordering::SeqCst);
            slot_in_callback.lock().expect("slot lock").take();
        });
        *slot.lock().expect("slot lock") = Some(subscription);

        registry.notify(&key, &Change::Invalidated);
        registry.notify(&key, &Change::Invalidated);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.subscriber_count(&key), 0);
    }

    #[test]
    fn handle_outliving_registry_is_harmless() {
        let registry = SubscriberRegistry::<u32>::new();
        let subscription = registry.subscribe(CacheKey::from("profiles"), |_key, _change| {});
        drop(registry);
        drop(subscription);
    }
}
