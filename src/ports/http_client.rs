use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use thiserror::Error;

/// Failures of an upstream exchange. Backend statuses are never errors here: a 5xx
/// answer is a response the gateway relays.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Connect or transport failure; rendered as `502`
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// No response head within the read timeout; rendered as `504`
    #[error("Timeout error after {0} seconds")]
    Timeout(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Outbound HTTP used by `http-proxy` endpoints and the health checker.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send `req` to the authority of its URI and stream the response body back.
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>>;

    /// `true` when `url` answers with a 2xx within `timeout_secs`.
    async fn health_check(&self, url: &str, timeout_secs: u64) -> HttpClientResult<bool>;
}
