//! Cache entry, per-key state and change notifications.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;

/// Monotonic per-cache counter tagging fetch starts and writes.
///
/// A settled fetch is only applied while its generation is still the latest
/// one dispatched for its key.
pub type Generation = u64;

/// Latest known value for a key.
#[derive(Debug)]
pub struct CacheEntry<V> {
    /// Last successfully fetched (or directly set) value.
    pub value: Arc<V>,
    /// When the value was fetched, on the monotonic clock.
    pub fetched_at: Instant,
    /// Wall-clock time of the same moment, for diagnostics.
    pub stored_at: OffsetDateTime,
    /// Time-to-live after which the entry is served as stale.
    pub stale_after: Duration,
    /// Generation that produced this entry.
    pub generation: Generation,
}

// Manual impl: cloning an entry only clones the `Arc`, so `V: Clone` is not required.
impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
            stored_at: self.stored_at,
            stale_after: self.stale_after,
            generation: self.generation,
        }
    }
}

impl<V> CacheEntry<V> {
    /// Time elapsed since the value was fetched.
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.fetched_at)
    }

    /// `now - fetched_at < stale_after`.
    pub fn is_fresh_within(&self, stale_after: Duration) -> bool {
        self.age() < stale_after
    }

    /// Freshness against the entry's own time-to-live.
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_within(self.stale_after)
    }
}

/// Observable state of a key.
///
/// `Absent → Loading → Fresh → Stale → Loading → Fresh → …`; invalidation
/// returns any state to `Absent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Absent,
    Loading,
    Fresh,
    Stale,
}

/// What happened to a key, as delivered to subscribers.
#[derive(Debug)]
pub enum Change<V> {
    /// A new value was stored.
    Updated(Arc<V>),
    /// The entry was removed by `invalidate`.
    Invalidated,
    /// The entry was dropped to make room for another key.
    Evicted,
    /// The whole cache was cleared.
    Cleared,
}

impl<V> Clone for Change<V> {
    fn clone(&self) -> Self {
        match self {
            Change::Updated(value) => Change::Updated(Arc::clone(value)),
            Change::Invalidated => Change::Invalidated,
            Change::Evicted => Change::Evicted,
            Change::Cleared => Change::Cleared,
        }
    }
}

impl<V> Change<V> {
    /// The value now held for the key, if any.
    pub fn value(&self) -> Option<&Arc<V>> {
        match self {
            Change::Updated(value) => Some(value),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Change::Updated(_) => "updated",
            Change::Invalidated => "invalidated",
            Change::Evicted => "evicted",
            Change::Cleared => "cleared",
        }
    }
}
