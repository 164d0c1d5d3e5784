use std::any::Any;
use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

use super::keys::CacheKey;

/// Boxed error accepted from fetch functions.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// A fetch function failed.
///
/// Cloneable so the same failure can be delivered to every caller joined to
/// the in-flight request.
#[derive(Debug, Clone, Error)]
#[error("fetch for `{key}` failed: {source}")]
pub struct FetchError {
    key: CacheKey,
    #[source]
    source: Arc<dyn StdError + Send + Sync>,
}

#[derive(Debug, Error)]
#[error("fetch panicked: {0}")]
struct FetchPanicked(String);

impl FetchError {
    pub fn new(key: CacheKey, source: impl Into<BoxError>) -> Self {
        Self {
            key,
            source: Arc::from(source.into()),
        }
    }

    pub(crate) fn panicked(key: CacheKey, payload: &(dyn Any + Send)) -> Self {
        Self::new(key, FetchPanicked(panic_message(payload).to_string()))
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The error returned by the fetch function.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.source.as_ref()
    }

    /// Downcast the underlying error to a concrete type.
    pub fn downcast_ref<T: StdError + 'static>(&self) -> Option<&T> {
        self.inner().downcast_ref::<T>()
    }

    /// True when the fetch panicked instead of returning an error.
    pub fn is_panic(&self) -> bool {
        self.downcast_ref::<FetchPanicked>().is_some()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
