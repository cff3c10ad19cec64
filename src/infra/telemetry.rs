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

/// Register descriptions for every metric the service emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "kvs_cache_hit_total",
            Unit::Count,
            "Reads answered with a cached value."
        );
        describe_counter!(
            "kvs_cache_miss_total",
            Unit::Count,
            "Reads for keys absent from the cache after reconciliation."
        );
        describe_counter!(
            "kvs_cache_warmed_total",
            Unit::Count,
            "Entries loaded into the cache at startup."
        );
        describe_counter!(
            "kvs_reconcile_total",
            Unit::Count,
            "Stale keys reconciled against the durable store, by marker kind."
        );
        describe_counter!(
            "kvs_reconcile_inconsistency_total",
            Unit::Count,
            "Keys expected in the durable store that were missing from it."
        );
        describe_counter!(
            "kvs_invalidation_published_total",
            Unit::Count,
            "Invalidations published, by kind."
        );
        describe_counter!(
            "kvs_invalidation_publish_failed_total",
            Unit::Count,
            "Invalidations given up on after every publish attempt failed."
        );
        describe_counter!(
            "kvs_invalidation_received_total",
            Unit::Count,
            "Invalidations delivered to this node, by kind."
        );
        describe_counter!(
            "kvs_invalidation_ignored_own_total",
            Unit::Count,
            "Delivered invalidations that this node published itself."
        );
        describe_counter!(
            "kvs_delivery_gap_total",
            Unit::Count,
            "Subscription gaps after which every cached key was distrusted."
        );
        describe_counter!(
            "kvs_bus_resubscribe_total",
            Unit::Count,
            "Attempts to re-establish the invalidation subscription."
        );
    });
}
