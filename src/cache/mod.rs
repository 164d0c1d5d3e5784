//! Cabinet Cache System
//!
//! Client-side data cache for dashboard reads, with stale-while-revalidate
//! semantics:
//!
//! - **Store**: latest value per key, bounded by an LRU, guarded by per-key
//!   generations so an older fetch never overwrites a newer write
//! - **Deduplicator**: at most one fetch per key in flight; concurrent readers
//!   join it and see the same result or the same error
//! - **Subscribers**: per-key callbacks notified on every change
//!
//! ## Configuration
//!
//! Cache behavior is controlled via the `[cache]` section of `cabinet.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! stale_after_ms = 300000
//! max_entries = 1024
//! ```

mod config;
mod entry;
mod error;
mod inflight;
mod keys;
mod lock;
mod registry;
mod store;
mod swr;
mod warmer;
mod watch;

pub use config::CacheConfig;
pub use entry::{CacheEntry, Change, Generation, KeyState};
pub use error::{BoxError, FetchError};
pub use inflight::{Deduplicator, Dispatch, FetchResult, PendingFetch};
pub use keys::{CacheKey, Resource, UnknownResource, hash_params, hash_value};
pub use registry::{SubscriberRegistry, Subscription};
pub use store::CacheStore;
pub use swr::{ReadOptions, ReadResult, SwrCache};
pub use warmer::{CacheWarmer, WarmHint, WarmReport};
pub use watch::CacheWatch;
