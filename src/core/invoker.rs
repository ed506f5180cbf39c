use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, StatusCode};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, warn};

use crate::{
    config::models::ApiType,
    core::{
        context::{ExecutionContext, attributes, internal},
        endpoint::{EndpointCriteria, EndpointManager, ManagedEndpoint},
        failure::{ExecutionFailure, keys},
        hooks::{HookOutcome, HookSet},
    },
    metrics,
    ports::connector::{ConnectorError, EntrypointConnector},
};

static NAMED_TARGET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:/]+):(.*)$").expect("target pattern is a valid regex"));

const ALLOWED_METHODS: [Method; 9] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::HEAD,
    Method::OPTIONS,
    Method::TRACE,
    Method::CONNECT,
];

/// How the target attribute designates the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointTarget {
    /// An absolute URL, used as is by the connector
    Absolute(String),
    /// `name:path`: endpoint or group name, then the path to call on it
    Named { name: String, path: String },
    /// A path relative to the selected endpoint
    Relative(String),
}

impl EndpointTarget {
    pub fn parse(value: &str) -> Self {
        let absolute = url::Url::parse(value).is_ok_and(|url| url.has_host());
        if absolute {
            return EndpointTarget::Absolute(value.to_string());
        }
        match NAMED_TARGET.captures(value) {
            Some(captures) => EndpointTarget::Named {
                name: captures[1].to_string(),
                path: captures[2].to_string(),
            },
            None => EndpointTarget::Relative(value.to_string()),
        }
    }
}

/// Performs the backend call for a request.
#[async_trait]
pub trait Invoker: Send + Sync {
    fn id(&self) -> &str;

    /// On failure, the returned failure has not been recorded on the context yet.
    async fn invoke(&self, ctx: &mut ExecutionContext) -> Result<(), ExecutionFailure>;
}

/// Default invoker: selects an endpoint of the API, negotiates QoS with the entrypoint and
/// delegates to the endpoint connector.
pub struct EndpointInvoker {
    api_type: ApiType,
    endpoints: Arc<EndpointManager>,
    hooks: HookSet,
}

impl EndpointInvoker {
    pub fn new(api_type: ApiType, endpoints: Arc<EndpointManager>, hooks: HookSet) -> Self {
        Self {
            api_type,
            endpoints,
            hooks,
        }
    }

    fn criteria(
        &self,
        ctx: &mut ExecutionContext,
        entrypoint: &dyn EntrypointConnector,
    ) -> EndpointCriteria {
        let mut criteria = EndpointCriteria::new()
            .with_api_type(entrypoint.supported_api())
            .with_modes(entrypoint.supported_modes().iter().copied());

        let Some(target) = ctx
            .attribute_str(attributes::ATTR_REQUEST_ENDPOINT)
            .map(str::to_string)
        else {
            return criteria;
        };

        if let EndpointTarget::Named { name, path } = EndpointTarget::parse(&target) {
            criteria = criteria.with_name(name);
            if path.is_empty() {
                ctx.remove_attribute(attributes::ATTR_REQUEST_ENDPOINT);
            } else {
                ctx.set_attribute(attributes::ATTR_REQUEST_ENDPOINT, path);
            }
        }
        criteria
    }

    fn negotiate_qos(
        entrypoint: &dyn EntrypointConnector,
        endpoint: &ManagedEndpoint,
    ) -> Result<(), ExecutionFailure> {
        let connector = endpoint.connector();
        let (Some(requirement), Some(supported), Some(capabilities)) = (
            entrypoint.qos_requirement(),
            connector.supported_qos(),
            connector.supported_qos_capabilities(),
        ) else {
            return Err(ExecutionFailure::new(StatusCode::INTERNAL_SERVER_ERROR)
                .key(keys::INVALID_IMPLEMENTATION)
                .message("Invalid connector implementation: QoS is not declared"));
        };

        if !supported.contains(&requirement.qos) {
            return Err(ExecutionFailure::new(StatusCode::BAD_REQUEST)
                .key(keys::INCOMPATIBLE_QOS)
                .message("Incompatible Qos between entrypoint and endpoint")
                .parameter("entrypoint", entrypoint.id())
                .parameter("endpoint", endpoint.id()));
        }

        if !requirement.capabilities.is_subset(capabilities) {
            return Err(ExecutionFailure::new(StatusCode::BAD_REQUEST)
                .key(keys::INCOMPATIBLE_QOS_CAPABILITIES)
                .message("Incompatible Qos capabilities between entrypoint and endpoint")
                .parameter("entrypoint", entrypoint.id())
                .parameter("endpoint", endpoint.id()));
        }
        Ok(())
    }

    fn override_method(ctx: &mut ExecutionContext) -> Result<(), ExecutionFailure> {
        if let Some(method) = ctx.internal_attribute::<Method>(internal::REQUEST_METHOD).cloned() {
            ctx.request_mut().set_method(method);
            return Ok(());
        }

        let Some(value) = ctx.attribute(attributes::ATTR_REQUEST_METHOD) else {
            return Ok(());
        };
        let method = value
            .as_str()
            .and_then(|name| {
                ALLOWED_METHODS
                    .iter()
                    .find(|m| m.as_str().eq_ignore_ascii_case(name.trim()))
                    .cloned()
            })
            .ok_or_else(|| {
                ExecutionFailure::new(StatusCode::BAD_REQUEST)
                    .key(keys::INVALID_HTTP_METHOD)
                    .message("Http method can not be overridden: invalid method attribute")
                    .parameter("method", value.clone())
            })?;
        ctx.request_mut().set_method(method);
        Ok(())
    }

    async fn call(&self, ctx: &mut ExecutionContext) -> Result<(), ExecutionFailure> {
        let entrypoint = ctx
            .internal_attribute::<Arc<dyn EntrypointConnector>>(internal::ENTRYPOINT_CONNECTOR)
            .cloned()
            .ok_or_else(|| {
                error!(request.id = %ctx.request().id(), "No entrypoint connector on the context");
                ExecutionFailure::internal()
            })?;

        let criteria = self.criteria(ctx, entrypoint.as_ref());
        let endpoint = self.endpoints.next(&criteria).ok_or_else(|| {
            ExecutionFailure::new(StatusCode::NOT_FOUND)
                .key(keys::NO_ENDPOINT)
                .message("No endpoint available")
        })?;

        let endpoint_id = endpoint.id();
        debug!(request.id = %ctx.request().id(), endpoint = %endpoint_id, "Endpoint selected");
        ctx.set_internal_attribute(internal::ENDPOINT, endpoint_id.clone());

        if self.api_type == ApiType::Message {
            Self::negotiate_qos(entrypoint.as_ref(), &endpoint)?;
        }

        Self::override_method(ctx)?;

        let _timer = metrics::EndpointRequestTimer::new(&endpoint_id);
        let result = endpoint.connector().connect(ctx).await;
        match result {
            Ok(()) => {
                metrics::increment_endpoint_request_total(&endpoint_id, ctx.response().status().as_u16());
                Ok(())
            }
            Err(e) => {
                let failure = connector_failure(&e);
                metrics::increment_endpoint_request_total(&endpoint_id, failure.status_code());
                Err(failure)
            }
        }
    }
}

#[async_trait]
impl Invoker for EndpointInvoker {
    fn id(&self) -> &str {
        "endpoint-invoker"
    }

    async fn invoke(&self, ctx: &mut ExecutionContext) -> Result<(), ExecutionFailure> {
        if ctx.internal_flag(internal::INVOKER_SKIP) {
            debug!(request.id = %ctx.request().id(), "Invoker skipped");
            return Ok(());
        }

        self.hooks.pre(self.id(), ctx, None);
        let result = self.call(ctx).await;
        match &result {
            Ok(()) => self.hooks.outcome(self.id(), ctx, None, HookOutcome::Completed),
            Err(failure) => self
                .hooks
                .outcome(self.id(), ctx, None, HookOutcome::Failed(failure)),
        }
        result
    }
}

/// Normalize a connector error into the failure rendered to the client
pub fn connector_failure(error: &ConnectorError) -> ExecutionFailure {
    match error {
        ConnectorError::Rejected { status } => ExecutionFailure::new(*status),
        ConnectorError::Timeout(seconds) => ExecutionFailure::new(StatusCode::GATEWAY_TIMEOUT)
            .key(keys::GATEWAY_TIMEOUT)
            .message(format!("Backend did not respond within {seconds}s")),
        ConnectorError::Connection(cause) => {
            warn!(error = %cause, "Backend connection failed");
            ExecutionFailure::new(StatusCode::BAD_GATEWAY).key(keys::BAD_GATEWAY)
        }
        ConnectorError::Cancelled => {
            debug!("Backend call cancelled by the client");
            ExecutionFailure::new(StatusCode::BAD_GATEWAY).key(keys::BAD_GATEWAY)
        }
        ConnectorError::Failure(failure) => failure.clone(),
        other => {
            error!(error = %other, "Endpoint connector failed");
            ExecutionFailure::internal()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use axum::body::Body;
    use http::Request;
    use serde_json::json;

    use super::*;
    use crate::{
        config::models::{ConnectorMode, EndpointGroupDefinition, Qos, QosCapability},
        core::connector::ConnectorRegistry,
        ports::connector::{
            EndpointConfiguration, EndpointConnector, EndpointConnectorFactory, QosRequirement,
        },
    };

    struct CountingConnector {
        modes: HashSet<ConnectorMode>,
        qos: Option<HashSet<Qos>>,
        capabilities: Option<HashSet<QosCapability>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EndpointConnector for CountingConnector {
        fn id(&self) -> &str {
            "counting"
        }

        fn supported_api(&self) -> ApiType {
            ApiType::Message
        }

        fn supported_modes(&self) -> &HashSet<ConnectorMode> {
            &self.modes
        }

        fn supported_qos(&self) -> Option<&HashSet<Qos>> {
            self.qos.as_ref()
        }

        fn supported_qos_capabilities(&self) -> Option<&HashSet<QosCapability>> {
            self.capabilities.as_ref()
        }

        async fn connect(&self, ctx: &mut ExecutionContext) -> Result<(), ConnectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let method = ctx.request().method().to_string();
            ctx.set_attribute("method.seen", method);
            Ok(())
        }
    }

    struct SharedFactory(Arc<CountingConnector>);

    impl EndpointConnectorFactory for SharedFactory {
        fn connector_type(&self) -> &str {
            "counting"
        }

        fn create(
            &self,
            _configuration: EndpointConfiguration<'_>,
        ) -> Result<Arc<dyn EndpointConnector>, ConnectorError> {
            Ok(self.0.clone())
        }
    }

    struct TestEntrypoint {
        modes: HashSet<ConnectorMode>,
        requirement: Option<QosRequirement>,
    }

    #[async_trait]
    impl EntrypointConnector for TestEntrypoint {
        fn id(&self) -> &str {
            "test-entrypoint"
        }

        fn supported_api(&self) -> ApiType {
            ApiType::Message
        }

        fn supported_modes(&self) -> &HashSet<ConnectorMode> {
            &self.modes
        }

        fn qos_requirement(&self) -> Option<&QosRequirement> {
            self.requirement.as_ref()
        }

        fn matches(&self, _ctx: &ExecutionContext) -> bool {
            true
        }
    }

    fn counting_connector(qos: Option<Vec<Qos>>, capabilities: Option<Vec<QosCapability>>) -> Arc<CountingConnector> {
        Arc::new(CountingConnector {
            modes: [ConnectorMode::Subscribe].into_iter().collect(),
            qos: qos.map(|q| q.into_iter().collect()),
            capabilities: capabilities.map(|c| c.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn invoker(connector: Arc<CountingConnector>) -> EndpointInvoker {
        let mut registry = ConnectorRegistry::new();
        registry.register_endpoint(Arc::new(SharedFactory(connector)));
        let groups: Vec<EndpointGroupDefinition> = serde_json::from_value(json!([
            { "name": "events", "type": "counting", "endpoints": [{ "name": "broker" }] }
        ]))
        .unwrap();
        let manager = EndpointManager::new("api", &groups, &registry);
        EndpointInvoker::new(ApiType::Message, Arc::new(manager), HookSet::default())
    }

    fn context(requirement: Option<QosRequirement>) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(Request::new(Body::empty()), None);
        let entrypoint: Arc<dyn EntrypointConnector> = Arc::new(TestEntrypoint {
            modes: [ConnectorMode::Subscribe].into_iter().collect(),
            requirement,
        });
        ctx.set_internal_attribute(internal::ENTRYPOINT_CONNECTOR, entrypoint);
        ctx
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!(
            EndpointTarget::parse("billing:/invoices"),
            EndpointTarget::Named {
                name: "billing".to_string(),
                path: "/invoices".to_string()
            }
        );
        assert_eq!(
            EndpointTarget::parse("https://ext.example.com/x"),
            EndpointTarget::Absolute("https://ext.example.com/x".to_string())
        );
        assert_eq!(
            EndpointTarget::parse("/orders/1"),
            EndpointTarget::Relative("/orders/1".to_string())
        );
    }

    #[tokio::test]
    async fn test_named_target_rewrites_attribute() {
        let connector = counting_connector(Some(vec![Qos::Auto]), Some(vec![]));
        let invoker = invoker(connector.clone());
        let mut ctx = context(Some(QosRequirement::new(Qos::Auto)));
        ctx.set_attribute(attributes::ATTR_REQUEST_ENDPOINT, "broker:/topic");

        invoker.invoke(&mut ctx).await.unwrap();
        assert_eq!(ctx.attribute_str(attributes::ATTR_REQUEST_ENDPOINT), Some("/topic"));
        assert_eq!(
            ctx.internal_attribute::<String>(internal::ENDPOINT).map(String::as_str),
            Some("events:broker")
        );
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_absolute_target_is_untouched() {
        let connector = counting_connector(Some(vec![Qos::Auto]), Some(vec![]));
        let invoker = invoker(connector.clone());
        let mut ctx = context(Some(QosRequirement::new(Qos::Auto)));
        ctx.set_attribute(attributes::ATTR_REQUEST_ENDPOINT, "https://ext.example.com/x");

        invoker.invoke(&mut ctx).await.unwrap();
        assert_eq!(
            ctx.attribute_str(attributes::ATTR_REQUEST_ENDPOINT),
            Some("https://ext.example.com/x")
        );
    }

    #[tokio::test]
    async fn test_unknown_named_endpoint_is_not_found() {
        let connector = counting_connector(Some(vec![Qos::Auto]), Some(vec![]));
        let invoker = invoker(connector.clone());
        let mut ctx = context(Some(QosRequirement::new(Qos::Auto)));
        ctx.set_attribute(attributes::ATTR_REQUEST_ENDPOINT, "billing:/invoices");

        let failure = invoker.invoke(&mut ctx).await.unwrap_err();
        assert_eq!(failure.status, StatusCode::NOT_FOUND);
        assert_eq!(failure.key.as_deref(), Some(keys::NO_ENDPOINT));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_incompatible_qos() {
        let connector = counting_connector(Some(vec![Qos::None, Qos::Auto]), Some(vec![]));
        let invoker = invoker(connector.clone());
        let mut ctx = context(Some(QosRequirement::new(Qos::AtLeastOnce)));

        let failure = invoker.invoke(&mut ctx).await.unwrap_err();
        assert_eq!(failure.status, StatusCode::BAD_REQUEST);
        assert_eq!(failure.key.as_deref(), Some(keys::INCOMPATIBLE_QOS));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_incompatible_qos_capabilities() {
        let connector = counting_connector(Some(vec![Qos::AtLeastOnce]), Some(vec![QosCapability::Auto]));
        let invoker = invoker(connector.clone());
        let mut ctx = context(Some(
            QosRequirement::new(Qos::AtLeastOnce).with_capability(QosCapability::ManualAck),
        ));

        let failure = invoker.invoke(&mut ctx).await.unwrap_err();
        assert_eq!(failure.key.as_deref(), Some(keys::INCOMPATIBLE_QOS_CAPABILITIES));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_undeclared_qos_is_invalid_implementation() {
        let connector = counting_connector(None, None);
        let invoker = invoker(connector.clone());
        let mut ctx = context(Some(QosRequirement::new(Qos::Auto)));

        let failure = invoker.invoke(&mut ctx).await.unwrap_err();
        assert_eq!(failure.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(failure.key.as_deref(), Some(keys::INVALID_IMPLEMENTATION));

        let connector = counting_connector(Some(vec![Qos::Auto]), Some(vec![]));
        let without_requirement = self::invoker(connector);
        let mut ctx = context(None);
        let failure = without_requirement.invoke(&mut ctx).await.unwrap_err();
        assert_eq!(failure.key.as_deref(), Some(keys::INVALID_IMPLEMENTATION));
    }

    #[tokio::test]
    async fn test_method_override() {
        let connector = counting_connector(Some(vec![Qos::Auto]), Some(vec![]));
        let invoker = invoker(connector.clone());

        let mut ctx = context(Some(QosRequirement::new(Qos::Auto)));
        ctx.set_attribute(attributes::ATTR_REQUEST_METHOD, "post");
        invoker.invoke(&mut ctx).await.unwrap();
        assert_eq!(ctx.attribute_str("method.seen"), Some("POST"));

        let mut ctx = context(Some(QosRequirement::new(Qos::Auto)));
        ctx.set_internal_attribute(internal::REQUEST_METHOD, Method::PUT);
        invoker.invoke(&mut ctx).await.unwrap();
        assert_eq!(ctx.attribute_str("method.seen"), Some("PUT"));

        let mut ctx = context(Some(QosRequirement::new(Qos::Auto)));
        ctx.set_attribute(attributes::ATTR_REQUEST_METHOD, "FETCH");
        let failure = invoker.invoke(&mut ctx).await.unwrap_err();
        assert_eq!(failure.key.as_deref(), Some(keys::INVALID_HTTP_METHOD));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_skip_and_missing_entrypoint() {
        let connector = counting_connector(Some(vec![Qos::Auto]), Some(vec![]));
        let invoker = invoker(connector.clone());

        let mut ctx = context(None);
        ctx.set_internal_attribute(internal::INVOKER_SKIP, true);
        invoker.invoke(&mut ctx).await.unwrap();

        let mut ctx = ExecutionContext::new(Request::new(Body::empty()), None);
        let failure = invoker.invoke(&mut ctx).await.unwrap_err();
        assert_eq!(failure.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connector_error_mapping() {
        let rejected = connector_failure(&ConnectorError::Rejected {
            status: StatusCode::BAD_REQUEST,
        });
        assert_eq!(rejected.status, StatusCode::BAD_REQUEST);
        assert_eq!(connector_failure(&ConnectorError::Timeout(3)).status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            connector_failure(&ConnectorError::Connection("refused".into())).status,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            connector_failure(&ConnectorError::NotFound("x".into())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
