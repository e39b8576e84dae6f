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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "peercache_server_hit_total",
            Unit::Count,
            "Conditional requests answered with 304 from the serving cache."
        );
        describe_counter!(
            "peercache_server_miss_total",
            Unit::Count,
            "Requests that reached the handler."
        );
        describe_counter!(
            "peercache_server_store_total",
            Unit::Count,
            "Responses stamped with an ETag and stored."
        );
        describe_counter!(
            "peercache_client_store_total",
            Unit::Count,
            "Peer responses stored by the outbound client."
        );
        describe_counter!(
            "peercache_client_revalidated_total",
            Unit::Count,
            "Peer 304 answers replaced by the stored response."
        );
        describe_counter!(
            "peercache_invalidation_fired_total",
            Unit::Count,
            "Invalidation subscriptions fired by published mutations."
        );
    });
}
