//! Lightweight metrics helpers for Stockgate.
//!
//! Convenience functions and RAII timers wrapping the `metrics` crate macros. No
//! exporter is embedded; the application installs any compatible recorder.
//!
//! Provided metrics (labels vary by family):
//! * `stockgate_requests_total` (counter)
//! * `stockgate_request_duration_seconds` (histogram)
//! * `stockgate_resolve_total` (counter, by operation and outcome)
//! * `stockgate_upstream_attempts_total` (counter, by operation and outcome)
//! * `stockgate_upstream_request_duration_seconds` (histogram)
//! * `stockgate_proxy_failovers_total` (counter)
//! * `stockgate_proxy_live_status` (gauge per proxy)
//!
//! The `*Timer` structs leverage `Drop` to record durations even on early returns.
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const STOCKGATE_REQUESTS_TOTAL: &str = "stockgate_requests_total";
pub const STOCKGATE_REQUEST_DURATION_SECONDS: &str = "stockgate_request_duration_seconds";
pub const STOCKGATE_RESOLVE_TOTAL: &str = "stockgate_resolve_total";
pub const STOCKGATE_UPSTREAM_ATTEMPTS_TOTAL: &str = "stockgate_upstream_attempts_total";
pub const STOCKGATE_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "stockgate_upstream_request_duration_seconds";
pub const STOCKGATE_PROXY_FAILOVERS_TOTAL: &str = "stockgate_proxy_failovers_total";
pub const STOCKGATE_PROXY_LIVE_STATUS: &str = "stockgate_proxy_live_status";

/// Last reported liveness per proxy endpoint
pub static PROXY_LIVE_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_counter!(
        STOCKGATE_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of storefront HTTP requests handled."
    );
    describe_histogram!(
        STOCKGATE_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of storefront HTTP requests."
    );
    describe_counter!(
        STOCKGATE_RESOLVE_TOTAL,
        Unit::Count,
        "Stock and fetch resolutions by outcome."
    );
    describe_counter!(
        STOCKGATE_UPSTREAM_ATTEMPTS_TOTAL,
        Unit::Count,
        "Individual supplier attempts by outcome."
    );
    describe_histogram!(
        STOCKGATE_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of individual supplier attempts."
    );
    describe_counter!(
        STOCKGATE_PROXY_FAILOVERS_TOTAL,
        Unit::Count,
        "Times the active egress proxy was demoted after a transport failure."
    );
    describe_gauge!(
        STOCKGATE_PROXY_LIVE_STATUS,
        "Liveness of individual egress proxies (1 for live, 0 otherwise)"
    );

    Mutex::new(HashMap::new())
});

/// Set (and record) the liveness gauge for a proxy endpoint.
pub fn set_proxy_live_status(endpoint: &str, is_live: bool) {
    let value = if is_live { 1.0 } else { 0.0 };

    if let Ok(mut gauges) = PROXY_LIVE_GAUGES.lock() {
        gauges.insert(endpoint.to_string(), value);
    } else {
        tracing::error!("Failed to acquire lock for proxy liveness gauges");
        return;
    }

    gauge!(STOCKGATE_PROXY_LIVE_STATUS, "proxy" => endpoint.to_string()).set(value);
}

/// Drop the gauge entry of a proxy that left the pool.
pub fn clear_proxy_live_status(endpoint: &str) {
    if let Ok(mut gauges) = PROXY_LIVE_GAUGES.lock() {
        gauges.remove(endpoint);
    }
    gauge!(STOCKGATE_PROXY_LIVE_STATUS, "proxy" => endpoint.to_string()).set(0.0);
}

pub fn increment_request_total(path: &str, method: &str, status: u16) {
    counter!(
        STOCKGATE_REQUESTS_TOTAL,
        "path" => path.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(path: &str, method: &str, duration: std::time::Duration) {
    histogram!(
        STOCKGATE_REQUEST_DURATION_SECONDS,
        "path" => path.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Count a finished resolution (`success`, `unreachable`, `deadline`, `cancelled`).
pub fn increment_resolve_total(operation: &str, outcome: &str) {
    counter!(
        STOCKGATE_RESOLVE_TOTAL,
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Count one supplier attempt (`success` or an attempt error kind).
pub fn increment_upstream_attempt(operation: &str, outcome: &str) {
    counter!(
        STOCKGATE_UPSTREAM_ATTEMPTS_TOTAL,
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_upstream_request_duration(method: &str, route: &str, duration: std::time::Duration) {
    histogram!(
        STOCKGATE_UPSTREAM_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "route" => route.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_proxy_failover() {
    counter!(STOCKGATE_PROXY_FAILOVERS_TOTAL).increment(1);
}

/// RAII helper measuring storefront request duration.
pub struct RequestTimer {
    start: Instant,
    path: String,
    method: String,
}

impl RequestTimer {
    pub fn new(path: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            path: path.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.path, &self.method, self.start.elapsed());
    }
}

/// RAII helper measuring one supplier attempt; `route` is `direct` or a proxy endpoint.
pub struct UpstreamRequestTimer {
    start: Instant,
    method: String,
    route: String,
}

impl UpstreamRequestTimer {
    pub fn new(method: &str, route: &str) -> Self {
        Self {
            start: Instant::now(),
            method: method.to_string(),
            route: route.to_string(),
        }
    }
}

impl Drop for UpstreamRequestTimer {
    fn drop(&mut self) {
        record_upstream_request_duration(&self.method, &self.route, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing Stockgate metrics system");
    Lazy::force(&PROXY_LIVE_GAUGES);
    tracing::info!("Stockgate metrics system initialized successfully");
    Ok(())
}

/// Collect a snapshot of gauge values used for ad‑hoc exports.
pub fn get_current_metrics() -> HashMap<String, f64> {
    let mut metrics = HashMap::new();

    if let Ok(gauges) = PROXY_LIVE_GAUGES.lock() {
        for (proxy, live) in gauges.iter() {
            metrics.insert(format!("proxy_live_{proxy}"), *live);
        }
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_proxy_live_status() {
        set_proxy_live_status("192.0.2.10:3128", true);
        assert_eq!(
            PROXY_LIVE_GAUGES.lock().unwrap().get("192.0.2.10:3128"),
            Some(&1.0)
        );

        set_proxy_live_status("192.0.2.10:3128", false);
        assert_eq!(
            PROXY_LIVE_GAUGES.lock().unwrap().get("192.0.2.10:3128"),
            Some(&0.0)
        );
    }

    #[test]
    fn test_clear_proxy_live_status() {
        set_proxy_live_status("192.0.2.11:3128", true);
        clear_proxy_live_status("192.0.2.11:3128");
        assert!(!get_current_metrics().contains_key("proxy_live_192.0.2.11:3128"));
    }

    #[test]
    fn test_timers_record_on_drop() {
        drop(RequestTimer::new("/stock", "GET"));
        drop(UpstreamRequestTimer::new("POST", "direct"));
    }

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_get_current_metrics() {
        set_proxy_live_status("192.0.2.12:8080", true);
        let metrics = get_current_metrics();
        assert_eq!(metrics.get("proxy_live_192.0.2.12:8080"), Some(&1.0));
    }
}
