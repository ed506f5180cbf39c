//! Metrics helpers for the gateway.
//!
//! Thin wrappers around the `metrics` crate macros. No exporter is installed here; the
//! embedding application may install any compatible recorder.
//!
//! Provided metrics:
//! * `gatehouse_requests_total` (counter; api, method, status)
//! * `gatehouse_request_duration_seconds` (histogram; api, method)
//! * `gatehouse_endpoint_requests_total` (counter; endpoint, status)
//! * `gatehouse_endpoint_request_duration_seconds` (histogram; endpoint)
//! * `gatehouse_endpoint_health_status` (gauge per endpoint)
//! * `gatehouse_policy_failures_total` (counter; component, key)
//! * `gatehouse_websocket_sessions_total` (counter; outcome)
//! * `gatehouse_active_requests` (gauge)
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const GATEHOUSE_REQUESTS_TOTAL: &str = "gatehouse_requests_total";
pub const GATEHOUSE_REQUEST_DURATION_SECONDS: &str = "gatehouse_request_duration_seconds";
pub const GATEHOUSE_ENDPOINT_REQUESTS_TOTAL: &str = "gatehouse_endpoint_requests_total";
pub const GATEHOUSE_ENDPOINT_REQUEST_DURATION_SECONDS: &str =
    "gatehouse_endpoint_request_duration_seconds";
pub const GATEHOUSE_ENDPOINT_HEALTH_STATUS: &str = "gatehouse_endpoint_health_status";
pub const GATEHOUSE_POLICY_FAILURES_TOTAL: &str = "gatehouse_policy_failures_total";
pub const GATEHOUSE_WEBSOCKET_SESSIONS_TOTAL: &str = "gatehouse_websocket_sessions_total";
pub const GATEHOUSE_ACTIVE_REQUESTS: &str = "gatehouse_active_requests";

/// Last reported health per endpoint, keyed by `api/group:endpoint`
pub static ENDPOINT_HEALTH_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_gauge!(
        GATEHOUSE_ENDPOINT_HEALTH_STATUS,
        "Health status of individual endpoints (1 for up, 0 for down)"
    );
    describe_counter!(
        GATEHOUSE_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests handled by the gateway."
    );
    describe_histogram!(
        GATEHOUSE_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests handled by the gateway."
    );
    describe_counter!(
        GATEHOUSE_ENDPOINT_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests sent to endpoints."
    );
    describe_histogram!(
        GATEHOUSE_ENDPOINT_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of endpoint connections until the response head is available."
    );
    describe_counter!(
        GATEHOUSE_POLICY_FAILURES_TOTAL,
        Unit::Count,
        "Interruptions with a failure and technical errors, by component."
    );
    describe_counter!(
        GATEHOUSE_WEBSOCKET_SESSIONS_TOTAL,
        Unit::Count,
        "Proxied WebSocket sessions, by outcome."
    );
    describe_gauge!(
        GATEHOUSE_ACTIVE_REQUESTS,
        "Number of requests currently in flight."
    );

    Mutex::new(HashMap::new())
});

/// Set (and record) the health status gauge for an endpoint.
pub fn set_endpoint_health_status(endpoint_id: &str, is_up: bool) {
    let health_value = if is_up { 1.0 } else { 0.0 };

    if let Ok(mut gauges) = ENDPOINT_HEALTH_GAUGES.lock() {
        gauges.insert(endpoint_id.to_string(), health_value);
    } else {
        tracing::error!("Failed to acquire lock for endpoint health gauges");
        return;
    }

    gauge!(GATEHOUSE_ENDPOINT_HEALTH_STATUS, "endpoint" => endpoint_id.to_string()).set(health_value);
}

/// Count a request once its response has been produced.
pub fn increment_request_total(api: &str, method: &str, status: u16) {
    counter!(
        GATEHOUSE_REQUESTS_TOTAL,
        "api" => api.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(api: &str, method: &str, duration: std::time::Duration) {
    histogram!(
        GATEHOUSE_REQUEST_DURATION_SECONDS,
        "api" => api.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_endpoint_request_total(endpoint: &str, status: u16) {
    counter!(
        GATEHOUSE_ENDPOINT_REQUESTS_TOTAL,
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_endpoint_request_duration(endpoint: &str, duration: std::time::Duration) {
    histogram!(
        GATEHOUSE_ENDPOINT_REQUEST_DURATION_SECONDS,
        "endpoint" => endpoint.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_policy_failure(component: &str, key: &str) {
    counter!(
        GATEHOUSE_POLICY_FAILURES_TOTAL,
        "component" => component.to_string(),
        "key" => key.to_string()
    )
    .increment(1);
}

/// Count a finished WebSocket session (`closed`, `rejected`, `failed`, `aborted`).
pub fn increment_websocket_session(outcome: &str) {
    counter!(GATEHOUSE_WEBSOCKET_SESSIONS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn set_active_requests(count: u64) {
    gauge!(GATEHOUSE_ACTIVE_REQUESTS).set(count as f64);
}

/// RAII helper measuring an endpoint call.
pub struct EndpointRequestTimer {
    start: Instant,
    endpoint: String,
}

impl EndpointRequestTimer {
    pub fn new(endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
        }
    }
}

impl Drop for EndpointRequestTimer {
    fn drop(&mut self) {
        record_endpoint_request_duration(&self.endpoint, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    Lazy::force(&ENDPOINT_HEALTH_GAUGES);
    tracing::info!("Gateway metrics initialized");
    Ok(())
}
