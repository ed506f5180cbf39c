//! Policies shipped with the gateway.
//!
//! Each policy comes with a factory registered by [`default_policy_registry`]. Policies
//! acting on one side of the exchange take a `scope` (`request` or `response`) in their
//! configuration.
pub mod assign_attributes;
pub mod body_rewrite;
pub mod mock_response;
pub mod rate_limit;
pub mod transform_headers;

use std::sync::Arc;

use serde::Deserialize;

use crate::core::{context::Phase, policy::PolicyRegistry};

/// Phase a scoped policy acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    #[default]
    Request,
    Response,
}

impl PolicyScope {
    pub fn applies_to(self, phase: Phase) -> bool {
        matches!(
            (self, phase),
            (PolicyScope::Request, Phase::Request) | (PolicyScope::Response, Phase::Response)
        )
    }
}

pub fn default_policy_registry() -> PolicyRegistry {
    let mut registry = PolicyRegistry::new();
    registry.register(Arc::new(transform_headers::TransformHeadersFactory));
    registry.register(Arc::new(rate_limit::RateLimitFactory));
    registry.register(Arc::new(assign_attributes::AssignAttributesFactory));
    registry.register(Arc::new(body_rewrite::BodyRewriteFactory));
    registry.register(Arc::new(mock_response::MockResponseFactory));
    registry
}
