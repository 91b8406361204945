use crate::config::{LogFormat, TelemetryConfig};
use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub fn init(config: &TelemetryConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Events go to stdout, so logs must stay on stderr.
    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    if config.metrics_enabled {
        let addr: SocketAddr = ([0, 0, 0, 0], config.metrics_port).into();
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;

        tracing::info!(
            port = config.metrics_port,
            "Metrics endpoint started at http://0.0.0.0:{}/metrics",
            config.metrics_port
        );
    }

    describe_metrics();

    Ok(())
}

/// Register descriptions for every metric the shipper emits.
pub fn describe_metrics() {
    describe_counter!(
        "shipper_objects_discovered_total",
        Unit::Count,
        "Objects returned by bucket listings"
    );
    describe_counter!(
        "shipper_objects_processed_total",
        Unit::Count,
        "Objects fully published and committed to the cursor"
    );
    describe_counter!(
        "shipper_objects_skipped_total",
        Unit::Count,
        "Listed objects skipped because they were already done or not selected"
    );
    describe_counter!(
        "shipper_object_errors_total",
        Unit::Count,
        "Objects that failed terminally in a cycle"
    );
    describe_counter!(
        "shipper_events_published_total",
        Unit::Count,
        "Events handed to the publisher"
    );
    describe_counter!(
        "shipper_bytes_transferred_total",
        Unit::Bytes,
        "Object bytes downloaded"
    );
    describe_counter!(
        "shipper_retries_total",
        Unit::Count,
        "Remote calls retried after a transient failure"
    );
    describe_counter!(
        "shipper_object_retries_total",
        Unit::Count,
        "Listing and object fetch retries per bucket input"
    );
    describe_counter!(
        "shipper_empty_cycles_total",
        Unit::Count,
        "Listing cycles that found no new objects"
    );
    describe_counter!(
        "shipper_cursor_evictions_total",
        Unit::Count,
        "Cursor entries dropped by the retention policy"
    );
    describe_gauge!(
        "shipper_in_flight_objects",
        Unit::Count,
        "Objects dispatched to the worker pool and not yet finished"
    );
    describe_gauge!(
        "shipper_cursor_entries",
        Unit::Count,
        "Objects currently recorded as done"
    );
}

pub fn shutdown() {
    tracing::info!("Telemetry shut down");
}
