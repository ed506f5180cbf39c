use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use http::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::models::{ApiType, ConnectorMode, EntrypointDefinition, Qos, QosCapability},
    core::{context::ExecutionContext, failure::ExecutionFailure},
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectorError {
    /// No factory is registered for the connector type
    #[error("Connector '{0}' is not installed")]
    NotFound(String),

    #[error("Invalid configuration for connector '{connector}': {message}")]
    InvalidConfiguration { connector: String, message: String },

    /// The backend answered the connection attempt with an error status
    #[error("Backend rejected the connection with status {status}")]
    Rejected { status: StatusCode },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error after {0} seconds")]
    Timeout(u64),

    #[error("Request cancelled by the client")]
    Cancelled,

    /// The connector produced a failure to render as-is
    #[error("Connector failure: {0}")]
    Failure(ExecutionFailure),
}

impl ConnectorError {
    pub fn invalid_configuration(connector: &str, message: impl std::fmt::Display) -> Self {
        Self::InvalidConfiguration {
            connector: connector.to_string(),
            message: message.to_string(),
        }
    }
}

/// QoS an entrypoint needs from the endpoint it is connected to.
#[derive(Debug, Clone, PartialEq)]
pub struct QosRequirement {
    pub qos: Qos,
    pub capabilities: HashSet<QosCapability>,
}

impl QosRequirement {
    pub fn new(qos: Qos) -> Self {
        Self {
            qos,
            capabilities: HashSet::new(),
        }
    }

    pub fn with_capability(mut self, capability: QosCapability) -> Self {
        self.capabilities.insert(capability);
        self
    }
}

/// Client-facing side of an API: decides whether it handles a request and renders the
/// response for its protocol.
#[async_trait]
pub trait EntrypointConnector: Send + Sync {
    fn id(&self) -> &str;

    fn supported_api(&self) -> ApiType;

    fn supported_modes(&self) -> &HashSet<ConnectorMode>;

    /// `None` for connectors that do not take part in QoS negotiation
    fn qos_requirement(&self) -> Option<&QosRequirement> {
        None
    }

    fn matches(&self, ctx: &ExecutionContext) -> bool;

    async fn handle_request(&self, _ctx: &mut ExecutionContext) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn handle_response(&self, _ctx: &mut ExecutionContext) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Backend-facing side of an API.
#[async_trait]
pub trait EndpointConnector: Send + Sync {
    /// Connector type id, e.g. `http-proxy`
    fn id(&self) -> &str;

    fn supported_api(&self) -> ApiType;

    fn supported_modes(&self) -> &HashSet<ConnectorMode>;

    /// `None` when the connector does not declare QoS support
    fn supported_qos(&self) -> Option<&HashSet<Qos>> {
        None
    }

    fn supported_qos_capabilities(&self) -> Option<&HashSet<QosCapability>> {
        None
    }

    /// Base URL probed by the health checker, when the connector has one
    fn health_check_target(&self) -> Option<&str> {
        None
    }

    /// Perform the backend call, leaving the result on `ctx.response`
    async fn connect(&self, ctx: &mut ExecutionContext) -> Result<(), ConnectorError>;
}

pub trait EntrypointConnectorFactory: Send + Sync {
    fn connector_type(&self) -> &str;

    fn create(
        &self,
        definition: &EntrypointDefinition,
    ) -> Result<Arc<dyn EntrypointConnector>, ConnectorError>;
}

/// Effective configuration handed to an endpoint connector factory.
#[derive(Debug, Clone)]
pub struct EndpointConfiguration<'a> {
    pub endpoint_name: &'a str,
    pub configuration: &'a Value,
    pub shared_configuration: &'a Value,
}

pub trait EndpointConnectorFactory: Send + Sync {
    fn connector_type(&self) -> &str;

    fn create(
        &self,
        configuration: EndpointConfiguration<'_>,
    ) -> Result<Arc<dyn EndpointConnector>, ConnectorError>;
}
