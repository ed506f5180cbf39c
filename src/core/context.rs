use std::{
    any::Any,
    collections::HashMap,
    fmt,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{self, Poll},
};

use axum::body::Body;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{
    Stream, StreamExt,
    stream::BoxStream,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri, Version, header};
use http_body_util::{BodyStream as FrameStream, StreamBody};
use hyper::upgrade::OnUpgrade;
use once_cell::sync::OnceCell;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::{
    component::{ComponentError, ComponentRegistry},
    failure::ExecutionFailure,
    message::MessageStream,
    template::{TemplateEngine, TemplateError, TemplateVariableProvider},
};

/// Public attribute names understood by the gateway itself.
pub mod attributes {
    /// Target override: an absolute URL, a `name:path` pair or a plain path
    pub const ATTR_REQUEST_ENDPOINT: &str = "gatehouse.attribute.request.endpoint";
    /// Outbound method override
    pub const ATTR_REQUEST_METHOD: &str = "gatehouse.attribute.request.method";
    pub const ATTR_API: &str = "gatehouse.attribute.api";
    pub const ATTR_API_NAME: &str = "gatehouse.attribute.api.name";
    pub const ATTR_PLAN: &str = "gatehouse.attribute.plan";
    pub const ATTR_CONTEXT_PATH: &str = "gatehouse.attribute.context-path";
    pub const ATTR_API_KEY: &str = "gatehouse.attribute.api-key";
}

/// Internal attribute names, reserved for framework bookkeeping.
pub mod internal {
    pub const ENTRYPOINT_CONNECTOR: &str = "entrypoint.connector";
    pub const ENDPOINT: &str = "endpoint.id";
    pub const INVOKER_SKIP: &str = "invoker.skip";
    pub const SECURITY_SKIP: &str = "security.skip";
    pub const REQUEST_METHOD: &str = "request.method";
    pub const RESOLVED_FLOWS_PREFIX: &str = "flows.resolved.";
    /// Id of the last message the subscriber received; message endpoints resume after it
    pub const MESSAGES_RECOVERY_LAST_ID: &str = "messages.recovery.last-id";
    /// [`Completion`](super::Completion) of the request, taken over by upgraded sessions
    pub const COMPLETION: &str = "request.completion";
}

pub const REQUEST_ID_HEADER: &str = "x-gatehouse-request-id";
pub const TRANSACTION_ID_HEADER: &str = "x-gatehouse-transaction-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Request,
    Response,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Request => f.write_str("request"),
            Phase::Response => f.write_str("response"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransformError {
    /// The transform rejected the body; the untransformed body is kept
    #[error("Transformation interrupted: {0}")]
    Interrupted(ExecutionFailure),

    #[error("Unable to read body: {0}")]
    Body(String),
}

pub type BodyStream = BoxStream<'static, Result<Bytes, TransformError>>;

/// A streaming body transformation registered by a policy for one phase.
pub type BodyTransform = Arc<dyn Fn(BodyStream) -> BodyStream + Send + Sync>;

type CompletionFn = Box<dyn FnOnce() + Send>;

/// Caller-supplied callback fired exactly once when a request is done.
///
/// Plain requests complete when the client has read the response body to its end (see
/// [`Completion::on_body_end`]); upgraded WebSocket sessions take the handle off the
/// context and complete it when the session closes.
#[derive(Clone)]
pub struct Completion {
    callback: Arc<Mutex<Option<CompletionFn>>>,
}

impl Completion {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Arc::new(Mutex::new(Some(Box::new(callback)))),
        }
    }

    /// Run the callback; later calls are no-ops
    pub fn complete(&self) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Wrap `body` so the callback fires after its last frame, on a body error, or when
    /// the body is dropped before the end.
    pub fn on_body_end(self, body: Body) -> Body {
        Body::new(StreamBody::new(CompleteOnEnd {
            inner: FrameStream::new(body),
            completion: self,
        }))
    }
}

struct CompleteOnEnd<S> {
    inner: S,
    completion: Completion,
}

impl<S, T, E> Stream for CompleteOnEnd<S>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            self.completion.complete();
        }
        polled
    }
}

impl<S> Drop for CompleteOnEnd<S> {
    fn drop(&mut self) {
        self.completion.complete();
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

/// Deployment metadata stamped on every context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentMetadata {
    pub tenant: Option<String>,
    pub zone: Option<String>,
}

/// The inbound request as seen by policies and connectors.
pub struct GatewayRequest {
    parts: http::request::Parts,
    body: Option<Body>,
    id: String,
    transaction_id: String,
    remote_addr: Option<SocketAddr>,
    context_path: String,
    path_info: String,
    timestamp: DateTime<Utc>,
    on_upgrade: Option<OnUpgrade>,
}

impl GatewayRequest {
    pub fn new(request: Request<Body>, remote_addr: Option<SocketAddr>) -> Self {
        let (mut parts, body) = request.into_parts();
        let on_upgrade = parts.extensions.remove::<OnUpgrade>();
        let id = uuid::Uuid::new_v4().to_string();
        let transaction_id = parts
            .headers
            .get(TRANSACTION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| id.clone());
        let path_info = parts.uri.path().to_string();

        Self {
            parts,
            body: Some(body),
            id,
            transaction_id,
            remote_addr,
            context_path: "/".to_string(),
            path_info,
            timestamp: Utc::now(),
            on_upgrade,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.parts.method = method;
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.parts.uri.query()
    }

    /// Query parameters; repeated names keep every value in order
    pub fn query_params(&self) -> HashMap<String, Vec<String>> {
        let mut params: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(query) = self.query() {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                params
                    .entry(name.into_owned())
                    .or_default()
                    .push(value.into_owned());
            }
        }
        params
    }

    pub fn version(&self) -> Version {
        self.parts.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.parts.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Host without port, from the `Host` header or the request URI
    pub fn host(&self) -> Option<&str> {
        let raw = self
            .header(header::HOST.as_str())
            .or_else(|| self.parts.uri.host())?;
        Some(strip_port(raw))
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Path of the listener that accepted the request
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    /// Request path relative to the context path, always starting with `/`
    pub fn path_info(&self) -> &str {
        &self.path_info
    }

    pub fn set_context_path(&mut self, context_path: &str) {
        let trimmed = context_path.trim_end_matches('/');
        let remainder = self.path().strip_prefix(trimmed).unwrap_or(self.path());
        self.path_info = if remainder.starts_with('/') {
            remainder.to_string()
        } else {
            format!("/{remainder}")
        };
        self.context_path = if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        };
    }

    pub fn take_body(&mut self) -> Body {
        self.body.take().unwrap_or_else(Body::empty)
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = Some(body);
    }

    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.parts.extensions
    }

    /// `Upgrade: websocket` together with a `Connection` header listing `upgrade`
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .header(header::UPGRADE.as_str())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        let connection = self.parts.headers.get_all(header::CONNECTION).iter().any(|v| {
            v.to_str()
                .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
                .unwrap_or(false)
        });
        upgrade && connection
    }

    /// Client side of a protocol upgrade, available once
    pub fn take_on_upgrade(&mut self) -> Option<OnUpgrade> {
        self.on_upgrade.take()
    }
}

/// The response being built for the client.
pub struct GatewayResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<Body>,
    messages: Option<MessageStream>,
}

impl Default for GatewayResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: None,
            messages: None,
        }
    }
}

impl GatewayResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn take_body(&mut self) -> Body {
        self.body.take().unwrap_or_else(Body::empty)
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = Some(body);
    }

    pub fn set_messages(&mut self, messages: MessageStream) {
        self.messages = Some(messages);
    }

    pub fn take_messages(&mut self) -> Option<MessageStream> {
        self.messages.take()
    }
}

/// Per-request state shared by every stage of the pipeline.
///
/// A context is owned by exactly one request and never shared between tasks; stages
/// receive it as `&mut` in turn.
pub struct ExecutionContext {
    request: GatewayRequest,
    response: GatewayResponse,
    attributes: HashMap<String, Value>,
    internal: HashMap<String, Box<dyn Any + Send + Sync>>,
    components: Arc<ComponentRegistry>,
    template_providers: Vec<Arc<dyn TemplateVariableProvider>>,
    template_engine: OnceCell<TemplateEngine>,
    interrupted: bool,
    failure: Option<ExecutionFailure>,
    request_transforms: Vec<BodyTransform>,
    response_transforms: Vec<BodyTransform>,
    cancellation: CancellationToken,
    metadata: DeploymentMetadata,
}

impl ExecutionContext {
    pub fn new(request: Request<Body>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            request: GatewayRequest::new(request, remote_addr),
            response: GatewayResponse::default(),
            attributes: HashMap::new(),
            internal: HashMap::new(),
            components: Arc::new(ComponentRegistry::default()),
            template_providers: Vec::new(),
            template_engine: OnceCell::new(),
            interrupted: false,
            failure: None,
            request_transforms: Vec::new(),
            response_transforms: Vec::new(),
            cancellation: CancellationToken::new(),
            metadata: DeploymentMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: DeploymentMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach the deployment-scoped components and template variables of the matched API.
    pub fn bind_deployment(
        &mut self,
        components: Arc<ComponentRegistry>,
        template_providers: Vec<Arc<dyn TemplateVariableProvider>>,
    ) {
        self.components = components;
        self.template_providers = template_providers;
        self.template_engine = OnceCell::new();
    }

    pub fn request(&self) -> &GatewayRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut GatewayRequest {
        &mut self.request
    }

    pub fn response(&self) -> &GatewayResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut GatewayResponse {
        &mut self.response
    }

    pub fn metadata(&self) -> &DeploymentMetadata {
        &self.metadata
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    pub fn attributes(&self) -> &HashMap<String, Value> {
        &self.attributes
    }

    pub fn set_internal_attribute<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.internal.insert(name.into(), Box::new(value));
    }

    /// Typed internal attribute; `None` when absent or of another type
    pub fn internal_attribute<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.internal.get(name).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove_internal_attribute(&mut self, name: &str) -> bool {
        self.internal.remove(name).is_some()
    }

    pub fn internal_flag(&self, name: &str) -> bool {
        self.internal_attribute::<bool>(name).copied().unwrap_or(false)
    }

    pub fn component<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ComponentError> {
        self.components.get::<T>()
    }

    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    pub fn interrupt_with(&mut self, failure: ExecutionFailure) {
        self.interrupted = true;
        self.failure = Some(failure);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Clear the per-phase interruption flag; a recorded failure is kept for rendering.
    pub fn resume(&mut self) {
        self.interrupted = false;
    }

    pub fn failure(&self) -> Option<&ExecutionFailure> {
        self.failure.as_ref()
    }

    pub fn take_failure(&mut self) -> Option<ExecutionFailure> {
        self.failure.take()
    }

    pub fn register_transform(&mut self, phase: Phase, transform: BodyTransform) {
        match phase {
            Phase::Request => self.request_transforms.push(transform),
            Phase::Response => self.response_transforms.push(transform),
        }
    }

    pub fn take_transforms(&mut self, phase: Phase) -> Vec<BodyTransform> {
        match phase {
            Phase::Request => std::mem::take(&mut self.request_transforms),
            Phase::Response => std::mem::take(&mut self.response_transforms),
        }
    }

    pub fn template_engine(&self) -> &TemplateEngine {
        self.template_engine
            .get_or_init(|| TemplateEngine::new(&self.template_providers))
    }

    pub fn evaluate(&self, expression: &str) -> Result<Value, TemplateError> {
        self.template_engine()
            .evaluate(expression, &self.template_scope())
    }

    pub fn evaluate_condition(&self, condition: &str) -> Result<bool, TemplateError> {
        self.template_engine()
            .evaluate_condition(condition, &self.template_scope())
    }

    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        if !template.contains("{#") {
            return Ok(template.to_string());
        }
        self.template_engine()
            .render(template, &self.template_scope())
    }

    /// Request scoped template variables: `request`, `response`, `context` and `node`.
    fn template_scope(&self) -> Map<String, Value> {
        let request = &self.request;
        let params: Map<String, Value> = request
            .query_params()
            .into_iter()
            .map(|(name, mut values)| {
                let value = if values.len() == 1 {
                    Value::String(values.remove(0))
                } else {
                    Value::from(values)
                };
                (name, value)
            })
            .collect();

        let mut scope = Map::new();
        scope.insert(
            "request".to_string(),
            json!({
                "id": request.id(),
                "transactionId": request.transaction_id(),
                "method": request.method().as_str(),
                "uri": request.uri().to_string(),
                "path": request.path(),
                "pathInfo": request.path_info(),
                "contextPath": request.context_path(),
                "host": request.host(),
                "remoteAddress": request.remote_addr().map(|a| a.ip().to_string()),
                "timestamp": request.timestamp().timestamp_millis(),
                "headers": headers_to_json(request.headers()),
                "params": params,
            }),
        );
        scope.insert(
            "response".to_string(),
            json!({
                "status": self.response.status().as_u16(),
                "headers": headers_to_json(self.response.headers()),
            }),
        );
        scope.insert(
            "context".to_string(),
            json!({ "attributes": self.attributes }),
        );
        scope.insert(
            "node".to_string(),
            json!({ "tenant": self.metadata.tenant, "zone": self.metadata.zone }),
        );
        scope
    }
}

/// Header map as a JSON object of lowercase names; repeated headers are comma joined
fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for name in headers.keys() {
        let values: Vec<&str> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        map.insert(name.as_str().to_string(), Value::String(values.join(",")));
    }
    Value::Object(map)
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split(']').next().map(|h| &h[1..]).unwrap_or(host);
    }
    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map(|(name, _)| name)
        .unwrap_or(host)
}

/// Insert a header from strings, ignoring invalid names or values
pub fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> bool {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(uri: &str) -> ExecutionContext {
        let request = Request::builder()
            .uri(uri)
            .header("host", "api.acme.com:8443")
            .header("x-trace", "a")
            .header("x-trace", "b")
            .body(Body::empty())
            .unwrap();
        ExecutionContext::new(request, Some("10.0.0.7:5000".parse().unwrap()))
    }

    #[test]
    fn test_attributes_and_internal_namespace() {
        let mut ctx = context("/orders");
        ctx.set_attribute("user", "alice");
        ctx.set_internal_attribute("user", 7u32);

        assert_eq!(ctx.attribute_str("user"), Some("alice"));
        assert_eq!(ctx.internal_attribute::<u32>("user"), Some(&7));
        assert_eq!(ctx.internal_attribute::<String>("user"), None);

        assert_eq!(ctx.remove_attribute("user"), Some(Value::from("alice")));
        assert!(ctx.attribute("user").is_none());
        assert!(ctx.remove_internal_attribute("user"));
        assert!(!ctx.internal_flag(internal::INVOKER_SKIP));
    }

    #[test]
    fn test_context_path_and_path_info() {
        let mut ctx = context("/orders/42/items?page=2");
        ctx.request_mut().set_context_path("/orders/");
        assert_eq!(ctx.request().context_path(), "/orders");
        assert_eq!(ctx.request().path_info(), "/42/items");

        let mut ctx = context("/orders");
        ctx.request_mut().set_context_path("/orders");
        assert_eq!(ctx.request().path_info(), "/");

        let mut ctx = context("/anything");
        ctx.request_mut().set_context_path("/");
        assert_eq!(ctx.request().context_path(), "/");
        assert_eq!(ctx.request().path_info(), "/anything");
    }

    #[test]
    fn test_host_strips_port() {
        let ctx = context("/");
        assert_eq!(ctx.request().host(), Some("api.acme.com"));
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("localhost"), "localhost");
    }

    #[test]
    fn test_interruption_lifecycle() {
        let mut ctx = context("/");
        assert!(!ctx.is_interrupted());
        ctx.interrupt_with(ExecutionFailure::new(StatusCode::FORBIDDEN));
        assert!(ctx.is_interrupted());
        ctx.resume();
        assert!(!ctx.is_interrupted());
        assert_eq!(ctx.failure().map(|f| f.status_code()), Some(403));
    }

    #[test]
    fn test_template_variables() {
        let mut ctx = context("/orders?page=2&tag=a&tag=b");
        ctx.set_attribute("user", "alice");

        assert!(ctx.evaluate_condition("{#request.params.page == '2'}").unwrap());
        assert_eq!(
            ctx.render("{#request.headers['x-trace']}|{#context.attributes.user}").unwrap(),
            "a,b|alice"
        );
        assert_eq!(ctx.evaluate("request.params.tag[1]").unwrap(), Value::from("b"));
        assert_eq!(ctx.evaluate("request.remoteAddress").unwrap(), Value::from("10.0.0.7"));
    }

    #[test]
    fn test_component_lookup() {
        let mut ctx = context("/");
        assert!(ctx.component::<String>().is_err());
        let registry = ComponentRegistry::new().with(Arc::new("shared".to_string()));
        ctx.bind_deployment(Arc::new(registry), Vec::new());
        assert_eq!(ctx.component::<String>().unwrap().as_str(), "shared");
    }

    #[test]
    fn test_completion_fires_once() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = count.clone();
        let completion = Completion::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        completion.clone().complete();
        completion.complete();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_waits_for_the_end_of_the_body() {
        use http_body_util::BodyExt;

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = count.clone();
        let completion = Completion::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let chunks = futures_util::stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(b"a"))])
            .chain(futures_util::stream::pending());
        let mut body = completion.on_body_end(Body::from_stream(chunks));

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
        drop(body);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = count.clone();
        let completion = Completion::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let mut body = completion.on_body_end(Body::from("done"));
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"done"));
        assert!(body.frame().await.is_none());
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_websocket_upgrade_detection() {
        let request = Request::builder()
            .uri("/ws")
            .header("connection", "keep-alive, Upgrade")
            .header("upgrade", "websocket")
            .body(Body::empty())
            .unwrap();
        let ctx = ExecutionContext::new(request, None);
        assert!(ctx.request().is_websocket_upgrade());
        assert!(!context("/ws").request().is_websocket_upgrade());
    }
}
