//! Cache configuration.
//!
//! Controls freshness and capacity of the stale-while-revalidate cache via the
//! `[cache]` section of `cabinet.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_STALE_AFTER_MS: u64 = 5 * 60 * 1000;
const DEFAULT_MAX_ENTRIES: usize = 1024;

/// Cache configuration from `cabinet.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Store fetched values. When off, every read goes to the fetch function
    /// (still de-duplicated) and nothing is retained.
    pub enabled: bool,
    /// Default time-to-live (ms) after which an entry is served as stale.
    pub stale_after_ms: u64,
    /// Maximum number of keys kept before least-recently-used eviction.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    /// Default freshness window as a `Duration`.
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Returns the entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}
