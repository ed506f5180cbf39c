//! Built-in entrypoint and endpoint connectors.
pub mod http_get;
pub mod http_proxy;
pub mod mock;
pub mod websocket;

use std::sync::Arc;

use crate::core::connector::ConnectorRegistry;

/// Registry holding every connector shipped with the gateway.
pub fn default_connector_registry() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    registry.register_entrypoint(Arc::new(http_proxy::HttpProxyEntrypointFactory));
    registry.register_entrypoint(Arc::new(http_get::HttpGetEntrypointFactory));
    registry.register_endpoint(Arc::new(http_proxy::HttpProxyEndpointFactory));
    registry.register_endpoint(Arc::new(mock::MockEndpointFactory));
    registry
}
