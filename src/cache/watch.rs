//! `tokio::sync::watch` view over a single key.

use std::sync::Arc;

use tokio::sync::watch;

use super::keys::CacheKey;
use super::registry::Subscription;
use super::swr::SwrCache;

type Slot<V> = Option<Arc<V>>;

/// Latest value of one key as a watch channel.
///
/// The channel is fed by a cache subscription owned by this handle; dropping
/// the handle unsubscribes and closes every receiver cloned from it.
pub struct CacheWatch<V> {
    receiver: watch::Receiver<Slot<V>>,
    subscription: Subscription<V>,
}

impl<V> CacheWatch<V> {
    pub fn key(&self) -> &CacheKey {
        self.subscription.key()
    }

    /// Value as of the last notification.
    pub fn current(&self) -> Slot<V> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change. Returns `None` once the cache is gone.
    pub async fn changed(&mut self) -> Option<Slot<V>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    pub fn receiver(&self) -> watch::Receiver<Slot<V>> {
        self.receiver.clone()
    }
}

impl<V> SwrCache<V>
where
    V: Send + Sync + 'static,
{
    /// Watch `key`. The initial value is whatever is cached now.
    pub fn watch(&self, key: impl Into<CacheKey>) -> CacheWatch<V> {
        let key = key.into();
        let (sender, mut receiver) = watch::channel(None);
        let sender = Arc::new(sender);

        let feed = Arc::clone(&sender);
        let subscription = self.subscribe(key.clone(), move |_key, change| {
            feed.send_replace(change.value().cloned());
        });
        // Subscribe first so no change between the read and the registration is
        // lost, then seed only if no notification got in ahead of the seed.
        let current = self.get(&key);
        sender.send_if_modified(|slot| {
            if receiver.has_changed().unwrap_or(true) {
                return false;
            }
            *slot = current;
            true
        });
        receiver.borrow_and_update();

        CacheWatch {
            receiver,
            subscription,
        }
    }
}
