use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::PolicyScope;
use crate::{
    core::context::{ExecutionContext, Phase},
    ports::policy::{Policy, PolicyError, PolicyFactory, PolicyResult, parse_configuration},
};

pub const POLICY_ID: &str = "assign-attributes";

#[derive(Debug, Clone, Deserialize)]
pub struct AttributeEntry {
    pub name: String,
    /// Rendered with the template engine
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AssignAttributesConfig {
    pub scope: PolicyScope,
    pub attributes: Vec<AttributeEntry>,
}

/// Sets context attributes from templates, e.g. the endpoint target or a plan-specific
/// value consumed by later steps.
pub struct AssignAttributes {
    config: AssignAttributesConfig,
}

impl AssignAttributes {
    fn apply(&self, ctx: &mut ExecutionContext, phase: Phase) -> Result<PolicyResult, PolicyError> {
        if !self.config.scope.applies_to(phase) {
            return Ok(PolicyResult::Continue);
        }
        for attribute in &self.config.attributes {
            let value = ctx
                .render(&attribute.value)
                .map_err(|e| PolicyError::execution(POLICY_ID, format!("attribute '{}': {e}", attribute.name)))?;
            ctx.set_attribute(attribute.name.clone(), value);
        }
        Ok(PolicyResult::Continue)
    }
}

#[async_trait]
impl Policy for AssignAttributes {
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

pub struct AssignAttributesFactory;

impl PolicyFactory for AssignAttributesFactory {
    fn policy_id(&self) -> &str {
        POLICY_ID
    }

    fn create(&self, configuration: &Value) -> Result<Arc<dyn Policy>, PolicyError> {
        Ok(Arc::new(AssignAttributes {
            config: parse_configuration(POLICY_ID, configuration)?,
        }))
    }
}
