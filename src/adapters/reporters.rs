//! Built-in reporters: a `tracing` access log and the request metrics.
use crate::{
    metrics,
    ports::reporter::{Reporter, RequestMetrics},
};

/// Writes one access log event per request under the `gatehouse::access` target.
///
/// With JSON logging enabled the whole [`RequestMetrics`] record is attached as a
/// serialized field.
#[derive(Debug, Default)]
pub struct LogReporter {
    json: bool,
}

impl LogReporter {
    pub fn new(json: bool) -> Self {
        Self { json }
    }
}

impl Reporter for LogReporter {
    fn name(&self) -> &str {
        "log"
    }

    fn report(&self, m: &RequestMetrics) {
        if self.json {
            let record = serde_json::to_string(m).unwrap_or_default();
            tracing::info!(target: "gatehouse::access", record = %record, "access");
            return;
        }

        let remote = m.remote_addr.map(|addr| addr.to_string());
        tracing::info!(
            target: "gatehouse::access",
            request_id = %m.request_id,
            api = m.api_id.as_deref().unwrap_or("-"),
            method = %m.method,
            path = %m.path,
            status = m.status,
            endpoint = m.endpoint.as_deref().unwrap_or("-"),
            remote = remote.as_deref().unwrap_or("-"),
            duration_ms = m.duration.as_millis() as u64,
            failure_key = m.failure_key.as_deref().unwrap_or("-"),
            "{} {} {}",
            m.method,
            m.path,
            m.status
        );
    }
}

/// Feeds the request counters and latency histograms.
#[derive(Debug, Default)]
pub struct MetricsReporter;

impl Reporter for MetricsReporter {
    fn name(&self) -> &str {
        "metrics"
    }

    fn report(&self, m: &RequestMetrics) {
        // unmatched requests are grouped under a fixed label
        let api = m.api_id.as_deref().unwrap_or("unknown");
        metrics::increment_request_total(api, &m.method, m.status);
        metrics::record_request_duration(api, &m.method, m.duration);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;

    fn sample() -> RequestMetrics {
        RequestMetrics {
            request_id: "req-1".to_string(),
            transaction_id: "req-1".to_string(),
            timestamp: Utc::now(),
            api_id: Some("orders".to_string()),
            plan_id: None,
            method: "GET".to_string(),
            path: "/orders/1".to_string(),
            host: None,
            remote_addr: Some("127.0.0.1:4000".parse().unwrap()),
            status: 502,
            endpoint: Some("default:primary".to_string()),
            failure_key: Some("GATEWAY_CLIENT_CONNECTION_ERROR".to_string()),
            failure_message: Some("Bad gateway".to_string()),
            duration: Duration::from_millis(12),
            tenant: None,
            zone: None,
        }
    }

    #[test]
    fn test_reporters_accept_every_record_shape() {
        let mut unmatched = sample();
        unmatched.api_id = None;
        unmatched.endpoint = None;
        unmatched.failure_key = None;

        for reporter in [
            Box::new(LogReporter::new(false)) as Box<dyn Reporter>,
            Box::new(LogReporter::new(true)),
            Box::new(MetricsReporter),
        ] {
            reporter.report(&sample());
            reporter.report(&unmatched);
        }
    }

    #[test]
    fn test_metrics_serialize_duration_as_millis() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["duration"], 12);
        assert_eq!(value["api_id"], "orders");
    }
}
