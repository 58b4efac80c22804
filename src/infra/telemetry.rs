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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "ukiyo_fetch_attempts_total",
            Unit::Count,
            "Total number of upstream request attempts, including retries."
        );
        describe_counter!(
            "ukiyo_fetch_retries_total",
            Unit::Count,
            "Total number of retried upstream attempts."
        );
        describe_counter!(
            "ukiyo_meta_cache_hit_total",
            Unit::Count,
            "Total number of fresh metadata cache hits."
        );
        describe_counter!(
            "ukiyo_meta_cache_miss_total",
            Unit::Count,
            "Total number of metadata cache misses resulting in an upstream fetch."
        );
        describe_counter!(
            "ukiyo_meta_cache_stale_served_total",
            Unit::Count,
            "Total number of stale metadata entries served during upstream outages."
        );
        describe_counter!(
            "ukiyo_image_cache_hit_total",
            Unit::Count,
            "Total number of image cache hits served from disk."
        );
        describe_counter!(
            "ukiyo_image_cache_miss_total",
            Unit::Count,
            "Total number of image cache misses resulting in a download."
        );
        describe_counter!(
            "ukiyo_janitor_aged_out_total",
            Unit::Count,
            "Total number of cached images removed by the age pass."
        );
        describe_counter!(
            "ukiyo_janitor_evicted_total",
            Unit::Count,
            "Total number of full images evicted by the size pass."
        );
        describe_gauge!(
            "ukiyo_image_cache_bytes",
            Unit::Bytes,
            "Current total size of the on-disk image cache."
        );
    });
}
