use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
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

/// Register descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "strata_cache_hit_total",
            Unit::Count,
            "Total number of cache hits, per store."
        );
        describe_counter!(
            "strata_cache_miss_total",
            Unit::Count,
            "Total number of cache misses, per store."
        );
        describe_counter!(
            "strata_cache_put_total",
            Unit::Count,
            "Total number of entries written, per store."
        );
        describe_counter!(
            "strata_cache_evict_total",
            Unit::Count,
            "Total number of entries evicted for capacity, per store."
        );
        describe_counter!(
            "strata_cache_invalidate_total",
            Unit::Count,
            "Total number of entries removed by invalidation, per store."
        );
        describe_gauge!(
            "strata_cache_entries",
            Unit::Count,
            "Current number of entries held, per store."
        );
        describe_counter!(
            "strata_cache_capture_abandoned_total",
            Unit::Count,
            "Total number of response captures abandoned, by reason."
        );
    });
}
