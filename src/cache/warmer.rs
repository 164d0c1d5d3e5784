use std::collections::HashSet;
use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use metrics::histogram;
use tracing::{info, warn};

use super::error::{BoxError, FetchError};
use super::keys::CacheKey;
use super::swr::{ReadOptions, SwrCache};

const METRIC_WARM_MS: &str = "cabinet_cache_warm_ms";

type BoxedFetch<V> = Box<dyn FnOnce() -> BoxFuture<'static, Result<V, BoxError>> + Send>;

/// A key to warm and how to fetch it.
pub struct WarmHint<V> {
    key: CacheKey,
    fetch: BoxedFetch<V>,
}

impl<V> WarmHint<V>
where
    V: Send + 'static,
{
    pub fn new<F, Fut, E>(key: impl Into<CacheKey>, fetch_fn: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self {
            key: key.into(),
            fetch: Box::new(move || {
                async move {
                    let result: Result<V, BoxError> = fetch_fn().await.map_err(Into::into);
                    result
                }
                .boxed()
            }),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

/// Outcome of [`CacheWarmer::warm`].
#[derive(Debug, Default)]
pub struct WarmReport {
    /// Keys fetched and stored.
    pub warmed: Vec<CacheKey>,
    /// Keys already fresh, already loading, or listed twice.
    pub skipped: Vec<CacheKey>,
    pub failed: Vec<FetchError>,
}

impl WarmReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

enum WarmOutcome {
    Warmed(CacheKey),
    Skipped(CacheKey),
    Failed(FetchError),
}

/// Prefetches a batch of keys with bounded concurrency.
pub struct CacheWarmer<V> {
    cache: SwrCache<V>,
    concurrency: NonZeroUsize,
    options: ReadOptions,
}

impl<V> CacheWarmer<V>
where
    V: Send + Sync + 'static,
{
    pub fn new(cache: SwrCache<V>, concurrency: NonZeroUsize) -> Self {
        Self {
            cache,
            concurrency,
            options: ReadOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ReadOptions) -> Self {
        self.options = options;
        self
    }

    /// Prefetch every hinted key, at most `concurrency` fetches at a time.
    ///
    /// Failures are collected in the report; they never abort the batch.
    pub async fn warm(&self, hints: Vec<WarmHint<V>>) -> WarmReport {
        info!(
            target = "cabinet::cache_warmer",
            hints = hints.len(),
            "warming cache"
        );
        let started_at = Instant::now();

        let mut seen = HashSet::new();
        let mut report = WarmReport::default();
        let mut unique = Vec::with_capacity(hints.len());
        for hint in hints {
            if seen.insert(hint.key.clone()) {
                unique.push(hint);
            } else {
                report.skipped.push(hint.key);
            }
        }

        let outcomes: Vec<WarmOutcome> = stream::iter(unique)
            .map(|WarmHint { key, fetch }| {
                let pending = self.cache.prefetch(key.clone(), fetch, self.options);
                async move {
                    match pending {
                        None => WarmOutcome::Skipped(key),
                        Some(pending) => match pending.await {
                            Ok(_) => WarmOutcome::Warmed(key),
                            Err(error) => WarmOutcome::Failed(error),
                        },
                    }
                }
            })
            .buffer_unordered(self.concurrency.get())
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                WarmOutcome::Warmed(key) => report.warmed.push(key),
                WarmOutcome::Skipped(key) => report.skipped.push(key),
                WarmOutcome::Failed(error) => {
                    warn!(
                        target = "cabinet::cache_warmer",
                        cache_key = %error.key(),
                        error = %error,
                        "failed to warm key"
                    );
                    report.failed.push(error);
                }
            }
        }

        histogram!(METRIC_WARM_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        info!(
            target = "cabinet::cache_warmer",
            warmed = report.warmed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "cache warm-up finished"
        );
        report
    }
}
