use std::collections::HashMap;

use http::StatusCode;
use serde_json::Value;

/// Well-known failure keys.
pub mod keys {
    pub const NO_CONTEXT_PATH: &str = "GATEWAY_NO_CONTEXT_PATH";
    pub const NO_ENTRYPOINT: &str = "NO_ENTRYPOINT_FOUND";
    pub const NO_ENDPOINT: &str = "NO_ENDPOINT_FOUND";
    pub const INVALID_HTTP_METHOD: &str = "INVALID_HTTP_METHOD";
    pub const INCOMPATIBLE_QOS: &str = "INCOMPATIBLE_QOS";
    pub const INCOMPATIBLE_QOS_CAPABILITIES: &str = "INCOMPATIBLE_QOS_CAPABILITIES";
    pub const INVALID_IMPLEMENTATION: &str = "INVALID_IMPLEMENTATION";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
    pub const PLAN_UNRESOLVABLE: &str = "GATEWAY_PLAN_UNRESOLVABLE";
    pub const API_KEY_MISSING: &str = "API_KEY_MISSING";
    pub const API_KEY_INVALID: &str = "API_KEY_INVALID";
    pub const CORS_PREFLIGHT_FAILED: &str = "CORS_PREFLIGHT_FAILED";
    pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
    pub const GATEWAY_TIMEOUT: &str = "GATEWAY_TIMEOUT";
    pub const BAD_GATEWAY: &str = "BAD_GATEWAY";
    pub const RATE_LIMIT_TOO_MANY_REQUESTS: &str = "RATE_LIMIT_TOO_MANY_REQUESTS";
    pub const CLIENT_ABORTED: &str = "CLIENT_ABORTED";
}

/// A request failure recorded on the execution context.
///
/// Failures are data: whoever detects one attaches it to the context and the reactor's
/// response funnel is the only place that turns it into a client response.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFailure {
    pub status: StatusCode,
    pub key: Option<String>,
    pub message: Option<String>,
    pub content_type: Option<String>,
    pub parameters: HashMap<String, Value>,
}

impl ExecutionFailure {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            key: None,
            message: None,
            content_type: None,
            parameters: HashMap::new(),
        }
    }

    /// 500 failure with the generic internal error key; the cause is logged, never rendered
    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR)
            .key(keys::INTERNAL_SERVER_ERROR)
            .message("Internal Server Error")
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    /// Message to render, defaulting to the status' canonical reason
    pub fn display_message(&self) -> String {
        self.message.clone().unwrap_or_else(|| {
            self.status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string()
        })
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.display_message())?;
        if let Some(key) = &self.key {
            write!(f, " [{key}]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_message_defaults_to_reason() {
        let failure = ExecutionFailure::new(StatusCode::BAD_GATEWAY);
        assert_eq!(failure.display_message(), "Bad Gateway");
        assert_eq!(failure.to_string(), "502 Bad Gateway");
    }

    #[test]
    fn test_builder() {
        let failure = ExecutionFailure::new(StatusCode::BAD_REQUEST)
            .key(keys::INCOMPATIBLE_QOS)
            .message("Incompatible Qos")
            .parameter("qos", "at_least_once");
        assert_eq!(failure.status_code(), 400);
        assert_eq!(failure.key.as_deref(), Some("INCOMPATIBLE_QOS"));
        assert_eq!(failure.parameters["qos"], "at_least_once");
        assert_eq!(failure.to_string(), "400 Incompatible Qos [INCOMPATIBLE_QOS]");
    }
}
