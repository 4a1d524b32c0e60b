use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

pub const METRIC_HIT: &str = "recall_cache_hit_total";
pub const METRIC_MISS: &str = "recall_cache_miss_total";
pub const METRIC_STALE: &str = "recall_cache_stale_total";
pub const METRIC_CORRUPT: &str = "recall_cache_corrupt_total";
pub const METRIC_MEMORY_EVICT: &str = "recall_memory_evict_total";
pub const METRIC_UPSTREAM_FAILURE: &str = "recall_upstream_failure_total";
pub const METRIC_CALL_DURATION_MS: &str = "recall_call_duration_ms";

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
#[error("telemetry initialisation failed: {0}")]
pub struct TelemetryError(String);

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
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
        .map_err(|err| TelemetryError(format!("failed to install tracing subscriber: {err}")))
}

/// Registers metric units and help text with the installed recorder. Runs once per process.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_HIT,
            Unit::Count,
            "Cache reads that returned a fresh entry."
        );
        describe_counter!(
            METRIC_MISS,
            Unit::Count,
            "Cache reads that found no usable entry."
        );
        describe_counter!(
            METRIC_STALE,
            Unit::Count,
            "Cache reads that returned an expired entry."
        );
        describe_counter!(
            METRIC_CORRUPT,
            Unit::Count,
            "Stored payloads that could not be decoded and were discarded."
        );
        describe_counter!(
            METRIC_MEMORY_EVICT,
            Unit::Count,
            "Entries evicted from the in-memory store due to capacity."
        );
        describe_counter!(
            METRIC_UPSTREAM_FAILURE,
            Unit::Count,
            "Network fetches that failed or produced no response."
        );
        describe_histogram!(
            METRIC_CALL_DURATION_MS,
            Unit::Milliseconds,
            "End-to-end duration of cached calls."
        );
    });
}
