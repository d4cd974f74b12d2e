//! Prometheus metrics for the degenscore server.
//!
//! Counters and histograms for analyses, explorer calls, cache behaviour and
//! rate limiting.

use metrics::{counter, histogram};

/// Record a completed analysis.
pub fn record_analysis(rank: &str, duration_ms: u64) {
    counter!("analyses_total", "rank" => rank.to_string()).increment(1);
    histogram!("analysis_duration_ms").record(duration_ms as f64);
}

/// Record an explorer API call.
pub fn record_upstream_call(action: &str, success: bool, duration_ms: u64) {
    counter!("upstream_calls_total", "action" => action.to_string(), "success" => success.to_string())
        .increment(1);
    histogram!("upstream_call_duration_ms").record(duration_ms as f64);
}

/// Record a cache hit.
pub fn record_cache_hit(kind: &str) {
    counter!("cache_hits_total", "kind" => kind.to_string()).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss(kind: &str) {
    counter!("cache_misses_total", "kind" => kind.to_string()).increment(1);
}

/// Record a request that joined an analysis already in flight.
pub fn record_inflight_join() {
    counter!("inflight_joins_total").increment(1);
}

/// Record entries dropped by the cache sweeper.
pub fn record_cache_evictions(count: usize) {
    counter!("cache_evictions_total").increment(count as u64);
}

/// Record a rate limit hit.
pub fn record_rate_limit_hit() {
    counter!("rate_limit_hits_total").increment(1);
}

/// Install the Prometheus metrics exporter and return the recorder handle.
pub fn install_prometheus_recorder() -> eyre::Result<metrics_exporter_prometheus::PrometheusHandle> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| eyre::eyre!("failed to install Prometheus recorder: {e}"))
}
