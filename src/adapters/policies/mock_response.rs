use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use axum::body::Body;
use http::{StatusCode, header};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    core::context::{ExecutionContext, insert_header, internal},
    ports::policy::{Policy, PolicyError, PolicyFactory, PolicyResult, parse_configuration},
};

pub const POLICY_ID: &str = "mock-response";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockResponseConfig {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Rendered with the template engine
    pub content: String,
}

impl Default for MockResponseConfig {
    fn default() -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            content: String::new(),
        }
    }
}

/// Answers the request itself: the backend is never called, response flows still run.
pub struct MockResponse {
    status: StatusCode,
    config: MockResponseConfig,
}

#[async_trait]
impl Policy for MockResponse {
    fn id(&self) -> &str {
        POLICY_ID
    }

    async fn on_request(&self, ctx: &mut ExecutionContext) -> Result<PolicyResult, PolicyError> {
        let content = ctx
            .render(&self.config.content)
            .map_err(|e| PolicyError::execution(POLICY_ID, e))?;

        let response = ctx.response_mut();
        response.set_status(self.status);
        for (name, value) in &self.config.headers {
            insert_header(response.headers_mut(), name, value);
        }
        response.headers_mut().insert(header::CONTENT_LENGTH, content.len().into());
        response.set_body(Body::from(content));

        ctx.set_internal_attribute(internal::INVOKER_SKIP, true);
        Ok(PolicyResult::Continue)
    }
}

pub struct MockResponseFactory;

impl PolicyFactory for MockResponseFactory {
    fn policy_id(&self) -> &str {
        POLICY_ID
    }

    fn create(&self, configuration: &Value) -> Result<Arc<dyn Policy>, PolicyError> {
        let config: MockResponseConfig = parse_configuration(POLICY_ID, configuration)?;
        let status = StatusCode::from_u16(config.status)
            .map_err(|_| PolicyError::invalid_configuration(POLICY_ID, format!("invalid status {}", config.status)))?;
        Ok(Arc::new(MockResponse { status, config }))
    }
}

#[cfg(test)]
mod tests {
    use http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_mock_response_skips_invoker() {
        let policy = MockResponseFactory
            .create(&json!({
                "status": 201,
                "headers": {"content-type": "text/plain"},
                "content": "hello {#request.params['name']}"
            }))
            .unwrap();
        let request = Request::builder().uri("/greet?name=ada").body(Body::empty()).unwrap();
        let mut ctx = ExecutionContext::new(request, None);

        assert_eq!(policy.on_request(&mut ctx).await.unwrap(), PolicyResult::Continue);
        assert!(ctx.internal_flag(internal::INVOKER_SKIP));
        assert_eq!(ctx.response().status(), StatusCode::CREATED);
        assert_eq!(ctx.response().headers()["content-type"], "text/plain");

        let body = ctx.response_mut().take_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello ada");
    }

    #[test]
    fn test_invalid_status() {
        assert!(MockResponseFactory.create(&json!({"status": 1000})).is_err());
    }
}
