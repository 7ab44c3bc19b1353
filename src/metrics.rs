// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter, Unit,
};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {
    Count,
    Seconds,
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

/// Initializes the descriptions for all the metrics in the engine.
/// This should be called once at startup.
pub fn describe_metrics() {
    describe_gauge!("sentinel_up", "Engine process liveness (1=up).");

    // Chains / indexing
    describe_gauge!("chains_connected", "Number of chains with a live connector.");
    describe_counter!(
        "blocks_indexed_total",
        Unit::Count,
        "Blocks fetched and emitted by the indexer, labeled by chain."
    );
    describe_counter!(
        "blocks_skipped_total",
        Unit::Count,
        "Blocks jumped over because the backlog exceeded the batch cap."
    );
    describe_counter!(
        "indexer_cycle_failures_total",
        Unit::Count,
        "Indexing cycles skipped after an RPC failure."
    );
    describe_histogram!(
        "rpc_call_latency_seconds",
        Unit::Seconds,
        "Latency of chain RPC calls, labeled by chain and method."
    );
    describe_counter!("rpc_errors_total", Unit::Count, "Failed chain RPC calls.");

    // Cache
    describe_counter!("cache_hits_total", Unit::Count, "Cache hits by namespace.");
    describe_counter!("cache_miss_total", Unit::Count, "Cache misses by namespace.");

    // Monitoring / automation
    describe_histogram!(
        "monitor_cycle_seconds",
        Unit::Seconds,
        "Duration of a full contract monitoring cycle."
    );
    describe_counter!(
        "metric_call_fallbacks_total",
        Unit::Count,
        "Contract metric calls that failed and fell back to a partial score."
    );
    describe_counter!("triggers_fired_total", Unit::Count, "Automation triggers fired.");
    describe_counter!(
        "trigger_failures_total",
        Unit::Count,
        "Automation executions that failed."
    );

    // Broadcast / cross-chain
    describe_gauge!("broadcast_subscribers", "Live broadcast subscribers.");
    describe_counter!(
        "broadcast_dropped_total",
        Unit::Count,
        "Events dropped for slow subscribers."
    );
    describe_counter!(
        "cross_chain_messages_total",
        Unit::Count,
        "Cross-chain messages by final status."
    );
}

#[cfg(feature = "observability")]
pub fn install_prometheus_exporter(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;
    describe_metrics();
    gauge!("sentinel_up", 1.0);
    Ok(())
}

pub fn set_chains_connected(count: usize) {
    gauge!("chains_connected", count as f64);
}

pub fn record_rpc_call_latency(chain_id: u64, method: &'static str, duration: std::time::Duration) {
    histogram!("rpc_call_latency_seconds", duration.as_secs_f64(), "chain" => chain_id.to_string(), "method" => method);
}

pub fn increment_rpc_errors(chain_id: u64, method: &'static str) {
    counter!("rpc_errors_total", 1, "chain" => chain_id.to_string(), "method" => method);
}

pub fn increment_blocks_indexed(chain_id: u64, count: u64) {
    counter!("blocks_indexed_total", count, "chain" => chain_id.to_string());
}

pub fn increment_blocks_skipped(chain_id: u64, count: u64) {
    counter!("blocks_skipped_total", count, "chain" => chain_id.to_string());
}

pub fn increment_indexer_failures(chain_id: u64) {
    counter!("indexer_cycle_failures_total", 1, "chain" => chain_id.to_string());
}

pub fn increment_cache_hit(namespace: &str) {
    counter!("cache_hits_total", 1, "cache" => namespace.to_string());
}

pub fn increment_cache_miss(namespace: &str) {
    counter!("cache_miss_total", 1, "cache" => namespace.to_string());
}

pub fn record_monitor_cycle(duration: std::time::Duration) {
    histogram!("monitor_cycle_seconds", duration.as_secs_f64());
}

pub fn increment_metric_fallback(metric: &'static str) {
    counter!("metric_call_fallbacks_total", 1, "metric" => metric);
}

pub fn increment_trigger_fired(trigger_type: &'static str) {
    increment_counter!("triggers_fired_total", "type" => trigger_type);
}

pub fn increment_trigger_failure(trigger_type: &'static str) {
    increment_counter!("trigger_failures_total", "type" => trigger_type);
}

pub fn set_broadcast_subscribers(count: usize) {
    gauge!("broadcast_subscribers", count as f64);
}

pub fn increment_broadcast_dropped() {
    increment_counter!("broadcast_dropped_total");
}

pub fn increment_cross_chain_messages(status: &'static str) {
    counter!("cross_chain_messages_total", 1, "status" => status);
}
