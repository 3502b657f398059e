// src/metrics.rs
//
// With the `observability` feature disabled every helper compiles to a no-op,
// so call sites never need their own cfg churn.

/// Initializes the descriptions for all the metrics in the pipeline.
/// This should be called once at startup.
#[cfg(feature = "observability")]
pub fn describe_metrics() {
    use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    describe_gauge!("pipeline_up", "Pipeline process liveness (1=up).");
    describe_gauge!(
        "task_queue_size",
        "Current number of queued timestamps, labeled by reconciler kind."
    );
    describe_counter!(
        "reconciler_updates_total",
        Unit::Count,
        "Completed reconciler updates, labeled by kind and chain."
    );
    describe_counter!(
        "reconciler_update_failures_total",
        Unit::Count,
        "Failed reconciler updates (timestamp left unknown), labeled by kind and chain."
    );
    describe_histogram!(
        "multicall_batch_size",
        "Number of calls aggregated per multicall round trip."
    );
    describe_counter!(
        "rpc_calls_total",
        Unit::Count,
        "Raw RPC calls issued, labeled by component."
    );
}

#[cfg(not(feature = "observability"))]
pub fn describe_metrics() {}

/// Starts the Prometheus scrape endpoint on the given port.
#[cfg(feature = "observability")]
pub fn install_exporter(port: u16) -> anyhow::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::{Ipv4Addr, SocketAddr};

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    metrics::gauge!("pipeline_up", 1.0);
    Ok(())
}

#[cfg(not(feature = "observability"))]
pub fn install_exporter(_port: u16) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(feature = "observability")]
pub fn set_task_queue_size(kind: &'static str, size: f64) {
    metrics::gauge!("task_queue_size", size, "kind" => kind);
}

#[cfg(not(feature = "observability"))]
pub fn set_task_queue_size(_kind: &'static str, _size: f64) {}

#[cfg(feature = "observability")]
pub fn increment_reconciler_updates(kind: &'static str, chain: &'static str) {
    metrics::increment_counter!("reconciler_updates_total", "kind" => kind, "chain" => chain);
}

#[cfg(not(feature = "observability"))]
pub fn increment_reconciler_updates(_kind: &'static str, _chain: &'static str) {}

#[cfg(feature = "observability")]
pub fn increment_reconciler_update_failures(kind: &'static str, chain: &'static str) {
    metrics::increment_counter!("reconciler_update_failures_total", "kind" => kind, "chain" => chain);
}

#[cfg(not(feature = "observability"))]
pub fn increment_reconciler_update_failures(_kind: &'static str, _chain: &'static str) {}

#[cfg(feature = "observability")]
pub fn record_multicall_batch_size(size: f64) {
    metrics::histogram!("multicall_batch_size", size);
}

#[cfg(not(feature = "observability"))]
pub fn record_multicall_batch_size(_size: f64) {}

#[cfg(feature = "observability")]
pub fn increment_rpc_call(component: &'static str) {
    metrics::increment_counter!("rpc_calls_total", "component" => component);
}

#[cfg(not(feature = "observability"))]
pub fn increment_rpc_call(_component: &'static str) {}
