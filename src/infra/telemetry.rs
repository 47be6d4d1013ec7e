use std::sync::Once;

use metrics::{Unit, describe_counter};
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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pagecache_page_hit_total",
            Unit::Count,
            "Total number of pages served from the slow-path cache."
        );
        describe_counter!(
            "pagecache_page_miss_total",
            Unit::Count,
            "Total number of cacheable requests that found no stored page."
        );
        describe_counter!(
            "pagecache_page_store_total",
            Unit::Count,
            "Total number of pages written to storage."
        );
        describe_counter!(
            "pagecache_page_store_failed_total",
            Unit::Count,
            "Total number of page writes rejected by storage."
        );
        describe_counter!(
            "pagecache_kickstart_hit_total",
            Unit::Count,
            "Total number of pages served before the application ran."
        );
        describe_counter!(
            "pagecache_section_hit_total",
            Unit::Count,
            "Total number of sections served from the fragment cache."
        );
        describe_counter!(
            "pagecache_section_miss_total",
            Unit::Count,
            "Total number of sections rendered on a fragment cache miss."
        );
    });
}
