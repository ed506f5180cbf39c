use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::core::{context::ExecutionContext, failure::ExecutionFailure};

/// Errors raised while creating or executing a policy
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PolicyError {
    /// No factory is registered for the policy id
    #[error("Policy '{0}' is not installed")]
    PluginNotFound(String),

    #[error("Invalid configuration for policy '{policy}': {message}")]
    InvalidConfiguration { policy: String, message: String },

    #[error("Policy '{policy}' failed: {message}")]
    Execution { policy: String, message: String },
}

impl PolicyError {
    pub fn invalid_configuration(policy: &str, message: impl std::fmt::Display) -> Self {
        Self::InvalidConfiguration {
            policy: policy.to_string(),
            message: message.to_string(),
        }
    }

    pub fn execution(policy: &str, message: impl std::fmt::Display) -> Self {
        Self::Execution {
            policy: policy.to_string(),
            message: message.to_string(),
        }
    }
}

/// What the chain does after a policy ran.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyResult {
    Continue,
    /// Stop the chain; the policy already wrote the response
    Interrupt,
    /// Stop the chain and record the failure for the response funnel
    InterruptWith(ExecutionFailure),
}

/// A unit of cross-cutting behavior executed by the policy chain.
///
/// Both phases default to `Continue`, so a policy only implements the phase it acts on.
#[async_trait]
pub trait Policy: Send + Sync {
    fn id(&self) -> &str;

    async fn on_request(&self, _ctx: &mut ExecutionContext) -> Result<PolicyResult, PolicyError> {
        Ok(PolicyResult::Continue)
    }

    async fn on_response(&self, _ctx: &mut ExecutionContext) -> Result<PolicyResult, PolicyError> {
        Ok(PolicyResult::Continue)
    }
}

/// Creates policy instances from a step's configuration.
pub trait PolicyFactory: Send + Sync {
    fn policy_id(&self) -> &str;

    fn create(&self, configuration: &Value) -> Result<Arc<dyn Policy>, PolicyError>;
}

/// Deserialize a policy configuration, treating `null` as the type's default
pub fn parse_configuration<T>(policy: &str, configuration: &Value) -> Result<T, PolicyError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if configuration.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(configuration.clone())
        .map_err(|e| PolicyError::invalid_configuration(policy, e))
}
