use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::PolicyScope;
use crate::{
    core::context::{ExecutionContext, Phase, insert_header},
    ports::policy::{Policy, PolicyError, PolicyFactory, PolicyResult, parse_configuration},
};

pub const POLICY_ID: &str = "transform-headers";

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    /// May contain `{#...}` expressions
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransformHeadersConfig {
    pub scope: PolicyScope,
    pub add_headers: Vec<HeaderEntry>,
    pub remove_headers: Vec<String>,
    /// When not empty, every header not listed is removed
    pub whitelist_headers: Vec<String>,
}

/// Adds, overrides and removes request or response headers.
pub struct TransformHeaders {
    config: TransformHeadersConfig,
}

impl TransformHeaders {
    pub fn new(config: TransformHeadersConfig) -> Self {
        Self { config }
    }

    fn apply(&self, ctx: &mut ExecutionContext, phase: Phase) -> Result<PolicyResult, PolicyError> {
        if !self.config.scope.applies_to(phase) {
            return Ok(PolicyResult::Continue);
        }

        // templates see the headers as they were before this policy
        let mut rendered = Vec::with_capacity(self.config.add_headers.len());
        for entry in &self.config.add_headers {
            let value = ctx
                .render(&entry.value)
                .map_err(|e| PolicyError::execution(POLICY_ID, e))?;
            rendered.push((entry.name.as_str(), value));
        }

        let headers = match phase {
            Phase::Request => ctx.request_mut().headers_mut(),
            Phase::Response => ctx.response_mut().headers_mut(),
        };
        self.transform(headers, rendered);
        Ok(PolicyResult::Continue)
    }

    fn transform(&self, headers: &mut HeaderMap, rendered: Vec<(&str, String)>) {
        if !self.config.whitelist_headers.is_empty() {
            let allowed: Vec<HeaderName> = self
                .config
                .whitelist_headers
                .iter()
                .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
                .collect();
            let names: Vec<HeaderName> = headers.keys().cloned().collect();
            for name in names.into_iter().filter(|name| !allowed.contains(name)) {
                headers.remove(name);
            }
        }
        for name in &self.config.remove_headers {
            headers.remove(name.as_str());
        }
        for (name, value) in rendered {
            if !insert_header(headers, name, &value) {
                debug!(header = name, "Skipping invalid header");
            }
        }
    }
}

#[async_trait]
impl Policy for TransformHeaders {
    fn id(&self) -> &str {
        POLICY_ID
    }

    async fn on_request(&self, ctx: &mut ExecutionContext) -> Result<PolicyResult, PolicyError> {
        self.apply(ctx, Phase::Request)
    }

    async fn on_response(&self, ctx: &mut ExecutionContext) -> Result<PolicyResult, PolicyError> {
        self.apply(ctx, Phase::Response)
    }
}

pub struct TransformHeadersFactory;

impl PolicyFactory for TransformHeadersFactory {
    fn policy_id(&self) -> &str {
        POLICY_ID
    }

    fn create(&self, configuration: &Value) -> Result<Arc<dyn Policy>, PolicyError> {
        Ok(Arc::new(TransformHeaders::new(parse_configuration(POLICY_ID, configuration)?)))
    }
}
