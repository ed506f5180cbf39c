use std::{collections::HashMap, sync::Arc};

use tracing::debug;

use crate::{
    config::models::{ApiDefinition, EntrypointDefinition},
    core::context::ExecutionContext,
    ports::connector::{
        ConnectorError, EndpointConfiguration, EndpointConnector, EndpointConnectorFactory,
        EntrypointConnector, EntrypointConnectorFactory,
    },
};

/// Connector factories registered by type id.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    entrypoints: HashMap<String, Arc<dyn EntrypointConnectorFactory>>,
    endpoints: HashMap<String, Arc<dyn EndpointConnectorFactory>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entrypoint(&mut self, factory: Arc<dyn EntrypointConnectorFactory>) {
        self.entrypoints
            .insert(factory.connector_type().to_string(), factory);
    }

    pub fn register_endpoint(&mut self, factory: Arc<dyn EndpointConnectorFactory>) {
        self.endpoints
            .insert(factory.connector_type().to_string(), factory);
    }

    pub fn create_entrypoint(
        &self,
        definition: &EntrypointDefinition,
    ) -> Result<Arc<dyn EntrypointConnector>, ConnectorError> {
        self.entrypoints
            .get(&definition.kind)
            .ok_or_else(|| ConnectorError::NotFound(definition.kind.clone()))?
            .create(definition)
    }

    pub fn create_endpoint(
        &self,
        kind: &str,
        configuration: EndpointConfiguration<'_>,
    ) -> Result<Arc<dyn EndpointConnector>, ConnectorError> {
        self.endpoints
            .get(kind)
            .ok_or_else(|| ConnectorError::NotFound(kind.to_string()))?
            .create(configuration)
    }
}

/// Entrypoint connectors of a deployed API, tried in declaration order.
pub struct EntrypointResolver {
    connectors: Vec<Arc<dyn EntrypointConnector>>,
}

impl EntrypointResolver {
    pub fn new(api: &ApiDefinition, registry: &ConnectorRegistry) -> Result<Self, ConnectorError> {
        let mut connectors = Vec::new();
        for definition in api.effective_entrypoints() {
            let connector = registry.create_entrypoint(&definition)?;
            if connector.supported_api() != api.api_type {
                return Err(ConnectorError::invalid_configuration(
                    &definition.kind,
                    format!("entrypoint does not support {:?} APIs", api.api_type),
                ));
            }
            connectors.push(connector);
        }
        Ok(Self { connectors })
    }

    pub fn from_connectors(connectors: Vec<Arc<dyn EntrypointConnector>>) -> Self {
        Self { connectors }
    }

    /// First entrypoint connector accepting the request
    pub fn resolve(&self, ctx: &ExecutionContext) -> Option<Arc<dyn EntrypointConnector>> {
        let resolved = self.connectors.iter().find(|c| c.matches(ctx)).cloned();
        if let Some(connector) = &resolved {
            debug!(entrypoint = connector.id(), "Entrypoint resolved");
        }
        resolved
    }
}
