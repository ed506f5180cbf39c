//! `http-proxy` connectors: the entrypoint of proxy APIs and the endpoint forwarding
//! requests to an HTTP backend.
//!
//! The endpoint streams both bodies: the client body is handed to the backend request
//! and the backend body becomes the response body without buffering. WebSocket upgrade
//! requests are handed to [`super::websocket`].
use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use axum::body::Body;
use http::{HeaderValue, Request, Uri};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::websocket;
use crate::{
    adapters::http_client::HttpClientAdapter,
    config::models::{ApiType, ConnectorMode, EntrypointDefinition, HttpClientOptions},
    core::{
        context::{ExecutionContext, attributes},
        invoker::EndpointTarget,
    },
    ports::{
        connector::{
            ConnectorError, EndpointConfiguration, EndpointConnector, EndpointConnectorFactory, EntrypointConnector,
            EntrypointConnectorFactory,
        },
        http_client::{HttpClient, HttpClientError},
    },
    utils::headers::strip_for_http,
};

pub const CONNECTOR_TYPE: &str = "http-proxy";

fn request_response() -> HashSet<ConnectorMode> {
    [ConnectorMode::RequestResponse].into_iter().collect()
}

/// Accepts every request of a proxy API.
pub struct HttpProxyEntrypoint {
    modes: HashSet<ConnectorMode>,
}

impl HttpProxyEntrypoint {
    pub fn new() -> Self {
        Self {
            modes: request_response(),
        }
    }
}

impl Default for HttpProxyEntrypoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntrypointConnector for HttpProxyEntrypoint {
    fn id(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn supported_api(&self) -> ApiType {
        ApiType::Proxy
    }

    fn supported_modes(&self) -> &HashSet<ConnectorMode> {
        &self.modes
    }

    fn matches(&self, _ctx: &ExecutionContext) -> bool {
        true
    }
}

pub struct HttpProxyEntrypointFactory;

impl EntrypointConnectorFactory for HttpProxyEntrypointFactory {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn create(&self, _definition: &EntrypointDefinition) -> Result<Arc<dyn EntrypointConnector>, ConnectorError> {
        Ok(Arc::new(HttpProxyEntrypoint::new()))
    }
}

#[derive(Debug, Deserialize)]
struct HttpProxyEndpointConfiguration {
    target: String,
}

/// Forwards the request to `target` joined with the path info (or the target attribute).
pub struct HttpProxyEndpoint {
    target: String,
    options: HttpClientOptions,
    client: Arc<dyn HttpClient>,
    modes: HashSet<ConnectorMode>,
}

impl HttpProxyEndpoint {
    pub fn new(target: impl Into<String>, options: HttpClientOptions, client: Arc<dyn HttpClient>) -> Self {
        Self {
            target: target.into(),
            options,
            client,
            modes: request_response(),
        }
    }

    /// Backend URL for the request: an absolute target attribute is used as is, a relative
    /// one or the path info is appended to the endpoint target. The query is kept.
    pub fn target_url(&self, ctx: &ExecutionContext) -> String {
        let url = match ctx.attribute_str(attributes::ATTR_REQUEST_ENDPOINT) {
            Some(target) => match EndpointTarget::parse(target) {
                EndpointTarget::Absolute(url) => url,
                _ => join_path(&self.target, target),
            },
            None => join_path(&self.target, ctx.request().path_info()),
        };
        append_query(url, ctx.request().query())
    }
}

fn join_path(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn append_query(url: String, query: Option<&str>) -> String {
    match query.filter(|q| !q.is_empty()) {
        Some(query) if url.contains('?') => format!("{url}&{query}"),
        Some(query) => format!("{url}?{query}"),
        None => url,
    }
}

fn client_error(error: HttpClientError) -> ConnectorError {
    match error {
        HttpClientError::Timeout(seconds) => ConnectorError::Timeout(seconds),
        HttpClientError::ConnectionError(message) | HttpClientError::InvalidRequest(message) => {
            ConnectorError::Connection(message)
        }
    }
}

#[async_trait]
impl EndpointConnector for HttpProxyEndpoint {
    fn id(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn supported_api(&self) -> ApiType {
        ApiType::Proxy
    }

    fn supported_modes(&self) -> &HashSet<ConnectorMode> {
        &self.modes
    }

    fn health_check_target(&self) -> Option<&str> {
        Some(&self.target)
    }

    async fn connect(&self, ctx: &mut ExecutionContext) -> Result<(), ConnectorError> {
        let url = self.target_url(ctx);
        if ctx.request().is_websocket_upgrade() {
            return websocket::connect(ctx, &url, &self.options).await;
        }

        let uri: Uri = url
            .parse()
            .map_err(|e| ConnectorError::Connection(format!("Invalid backend URI '{url}': {e}")))?;
        debug!(request.id = %ctx.request().id(), backend = %uri, "Forwarding request");

        let mut headers = ctx.request().headers().clone();
        strip_for_http(&mut headers);
        if let Some(addr) = ctx.request().remote_addr() {
            if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
                headers.append("x-forwarded-for", value);
            }
        }

        let mut request = Request::new(ctx.request_mut().take_body());
        *request.method_mut() = ctx.request().method().clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;

        let cancellation = ctx.cancellation().clone();
        let response = tokio::select! {
            result = self.client.send_request(request) => result.map_err(client_error)?,
            _ = cancellation.cancelled() => return Err(ConnectorError::Cancelled),
        };

        let (parts, body) = response.into_parts();
        let mut headers = parts.headers;
        strip_for_http(&mut headers);
        let target = ctx.response_mut();
        target.set_status(parts.status);
        target.headers_mut().extend(headers);
        target.set_body(body);
        Ok(())
    }
}

pub struct HttpProxyEndpointFactory;

impl EndpointConnectorFactory for HttpProxyEndpointFactory {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn create(&self, configuration: EndpointConfiguration<'_>) -> Result<Arc<dyn EndpointConnector>, ConnectorError> {
        let endpoint: HttpProxyEndpointConfiguration = serde_json::from_value(configuration.configuration.clone())
            .map_err(|e| ConnectorError::invalid_configuration(CONNECTOR_TYPE, e))?;
        let options: HttpClientOptions = match configuration.shared_configuration {
            Value::Null => HttpClientOptions::default(),
            shared => serde_json::from_value(shared.clone())
                .map_err(|e| ConnectorError::invalid_configuration(CONNECTOR_TYPE, e))?,
        };
        let client = HttpClientAdapter::new(options.clone())
            .map_err(|e| ConnectorError::invalid_configuration(CONNECTOR_TYPE, e))?;

        Ok(Arc::new(HttpProxyEndpoint::new(endpoint.target, options, Arc::new(client))))
    }
}
