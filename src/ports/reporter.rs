use std::{net::SocketAddr, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Summary of one request, handed to reporters by the response funnel.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RequestMetrics {
    pub request_id: String,
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    pub api_id: Option<String>,
    pub plan_id: Option<String>,
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub remote_addr: Option<SocketAddr>,
    pub status: u16,
    /// `group:endpoint` of the endpoint that served the request
    pub endpoint: Option<String>,
    pub failure_key: Option<String>,
    pub failure_message: Option<String>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub tenant: Option<String>,
    pub zone: Option<String>,
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

/// Sink for per-request analytics. Called exactly once per request; must not block.
pub trait Reporter: Send + Sync {
    fn name(&self) -> &str;

    fn report(&self, metrics: &RequestMetrics);
}
