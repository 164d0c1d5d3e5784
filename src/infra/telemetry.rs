use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "cabinet_cache_hit_total",
            Unit::Count,
            "Reads answered from a fresh entry."
        );
        describe_counter!(
            "cabinet_cache_stale_total",
            Unit::Count,
            "Reads answered from a stale entry while revalidating."
        );
        describe_counter!(
            "cabinet_cache_miss_total",
            Unit::Count,
            "Reads with no cached entry."
        );
        describe_counter!(
            "cabinet_cache_evict_total",
            Unit::Count,
            "Entries evicted due to capacity."
        );
        describe_counter!(
            "cabinet_cache_fetch_total",
            Unit::Count,
            "Fetches started, labelled by outcome (ok|error|panic)."
        );
        describe_counter!(
            "cabinet_cache_fetch_joined_total",
            Unit::Count,
            "Callers that joined a fetch already in flight."
        );
        describe_counter!(
            "cabinet_cache_discarded_total",
            Unit::Count,
            "Fetch results discarded because a newer write or fetch superseded them."
        );
        describe_counter!(
            "cabinet_cache_subscriber_panic_total",
            Unit::Count,
            "Subscriber callbacks that panicked during notification."
        );
        describe_histogram!(
            "cabinet_cache_fetch_ms",
            Unit::Milliseconds,
            "Fetch latency in milliseconds."
        );
        describe_histogram!(
            "cabinet_cache_warm_ms",
            Unit::Milliseconds,
            "Cache warm-up batch latency in milliseconds."
        );
    });
}
