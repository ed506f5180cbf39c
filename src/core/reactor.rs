//! Request lifecycle owner.
//!
//! The [`Reactor`] keeps the deployed APIs and an acceptor table snapshot. For every
//! request it:
//! * builds the [`ExecutionContext`]
//! * resolves the acceptor (host, then longest path) of a deployed API
//! * runs the API's pipeline through its [`ApiReactor`]
//! * renders the outcome in the response funnel, which runs exactly once per request
//!   and notifies reporters
//!
//! Deployment events rebuild the acceptor table and swap it atomically; requests in
//! flight keep the snapshot they started with.
use std::{
    any::Any,
    collections::{BTreeSet, HashMap, HashSet},
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use axum::body::Body;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use http::{HeaderValue, Request, Response, StatusCode, header};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{Instrument, debug, error, info, warn};

use crate::{
    config::{
        models::{ApiDefinition, GatewayConfig},
        validation::{DefinitionValidator, ValidationError},
    },
    core::{
        acceptor::{AcceptorTable, HttpAcceptor},
        component::ComponentRegistry,
        connector::{ConnectorRegistry, EntrypointResolver},
        context::{
            Completion, DeploymentMetadata, ExecutionContext, Phase, REQUEST_ID_HEADER,
            TRANSACTION_ID_HEADER, attributes, insert_header, internal,
        },
        cors::{CorsOutcome, CorsProcessor},
        endpoint::{EndpointManager, EndpointVariableProvider},
        failure::{ExecutionFailure, keys},
        flow::{FlowResolver, FlowStage},
        hooks::{Hook, HookSet},
        invoker::{EndpointInvoker, Invoker, connector_failure},
        policy::{PolicyManager, PolicyRegistry},
        policy_chain::FlowChain,
        security::SecurityChain,
        template::{StaticVariableProvider, TemplateVariableProvider},
    },
    ports::{
        connector::{ConnectorError, EntrypointConnector},
        policy::PolicyError,
        reporter::{Reporter, RequestMetrics},
    },
    tracing_setup::create_request_span,
};

const NOT_FOUND_MESSAGE: &str = "No context-path matches the request URI.";

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("Invalid API definition: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unable to create connector: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Unable to create security chain: {0}")]
    Policy(#[from] PolicyError),

    #[error("Invalid CORS origin pattern: {0}")]
    Cors(#[from] regex::Error),
}

#[derive(Serialize)]
struct FailureBody<'a> {
    message: &'a str,
    http_status_code: u16,
}

/// Services shared by every deployed API.
struct SharedServices {
    policies: Arc<PolicyRegistry>,
    connectors: Arc<ConnectorRegistry>,
    hooks: HookSet,
    components: ComponentRegistry,
    template_providers: Vec<Arc<dyn TemplateVariableProvider>>,
    request_timeout: Option<Duration>,
}

/// Plugins a definition relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiDependencies {
    pub policies: BTreeSet<String>,
    pub connectors: BTreeSet<String>,
}

impl ApiDependencies {
    pub fn of(api: &ApiDefinition) -> Self {
        let policies = api
            .flows
            .iter()
            .chain(api.plans.iter().flat_map(|plan| plan.flows.iter()))
            .flat_map(|flow| flow.request.iter().chain(flow.response.iter()))
            .map(|step| step.policy.clone())
            .collect();
        let connectors = api
            .effective_entrypoints()
            .into_iter()
            .map(|entrypoint| entrypoint.kind)
            .chain(api.endpoint_groups.iter().flat_map(|group| {
                group
                    .endpoints
                    .iter()
                    .map(move |endpoint| endpoint.kind.clone().unwrap_or_else(|| group.kind.clone()))
            }))
            .collect();
        Self { policies, connectors }
    }
}

/// A deployed API: its chains, connectors and endpoints, built once per deployment and
/// replaced as a whole on update.
pub struct ApiReactor {
    definition: ApiDefinition,
    deployed_at: DateTime<Utc>,
    dependencies: ApiDependencies,
    components: Arc<ComponentRegistry>,
    template_providers: Vec<Arc<dyn TemplateVariableProvider>>,
    endpoints: Arc<EndpointManager>,
    entrypoints: EntrypointResolver,
    cors: Option<CorsProcessor>,
    security: SecurityChain,
    plan_chains: HashMap<String, FlowChain>,
    api_chain: FlowChain,
    invoker: Arc<dyn Invoker>,
    request_timeout: Option<Duration>,
}

impl ApiReactor {
    fn new(definition: ApiDefinition, shared: &SharedServices) -> Result<Self, ReactorError> {
        let api_id = definition.id.clone();
        let endpoints = Arc::new(EndpointManager::new(
            &api_id,
            &definition.endpoint_groups,
            &shared.connectors,
        ));
        let entrypoints = EntrypointResolver::new(&definition, &shared.connectors)?;
        let cors = definition
            .cors
            .as_ref()
            .filter(|cors| cors.enabled)
            .map(CorsProcessor::new)
            .transpose()?;

        let dependencies = ApiDependencies::of(&definition);
        for policy in dependencies.policies.iter().filter(|p| !shared.policies.contains(p)) {
            warn!(api.id = %api_id, policy = %policy, "Policy is not installed, requests reaching it will fail");
        }
        let policy_manager = Arc::new(PolicyManager::new(shared.policies.clone()));

        let security = SecurityChain::new(&definition.plans, shared.hooks.clone())?;
        let plan_chains = definition
            .plans
            .iter()
            .filter(|plan| !plan.flows.is_empty())
            .map(|plan| {
                let chain = FlowChain::new(
                    format!("{api_id}/plan/{}", plan.id),
                    FlowResolver::new(&plan.flows, FlowStage::Plan, definition.flow_mode),
                    policy_manager.clone(),
                    shared.hooks.clone(),
                );
                (plan.id.clone(), chain)
            })
            .collect();
        let api_chain = FlowChain::new(
            format!("{api_id}/api"),
            FlowResolver::new(&definition.flows, FlowStage::Api, definition.flow_mode),
            policy_manager,
            shared.hooks.clone(),
        );

        let components = shared.components.merged(
            &ComponentRegistry::new()
                .with(endpoints.clone())
                .with(Arc::new(definition.clone())),
        );
        let mut template_providers = shared.template_providers.clone();
        template_providers.push(Arc::new(EndpointVariableProvider::new(&endpoints)));
        template_providers.push(Arc::new(StaticVariableProvider::new(
            "api",
            json!({
                "id": definition.id,
                "name": definition.display_name(),
                "properties": definition.properties,
            }),
        )));

        let invoker = Arc::new(EndpointInvoker::new(
            definition.api_type,
            endpoints.clone(),
            shared.hooks.clone(),
        ));
        let request_timeout = definition
            .request_timeout_secs
            .map(Duration::from_secs)
            .or(shared.request_timeout);

        Ok(Self {
            definition,
            deployed_at: Utc::now(),
            dependencies,
            components: Arc::new(components),
            template_providers,
            endpoints,
            entrypoints,
            cors,
            security,
            plan_chains,
            api_chain,
            invoker,
            request_timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &ApiDefinition {
        &self.definition
    }

    pub fn deployed_at(&self) -> DateTime<Utc> {
        self.deployed_at
    }

    pub fn dependencies(&self) -> &ApiDependencies {
        &self.dependencies
    }

    pub fn endpoints(&self) -> &Arc<EndpointManager> {
        &self.endpoints
    }

    async fn handle(&self, ctx: &mut ExecutionContext, platform: &FlowChain) {
        ctx.bind_deployment(self.components.clone(), self.template_providers.clone());
        ctx.set_attribute(attributes::ATTR_API, self.definition.id.clone());
        ctx.set_attribute(attributes::ATTR_API_NAME, self.definition.display_name().to_string());
        let context_path = ctx.request().context_path().to_string();
        ctx.set_attribute(attributes::ATTR_CONTEXT_PATH, context_path);

        match self.request_timeout {
            Some(timeout) => {
                if tokio::time::timeout(timeout, self.execute(ctx, platform))
                    .await
                    .is_err()
                {
                    warn!(
                        request.id = %ctx.request().id(),
                        timeout_secs = timeout.as_secs(),
                        "Request timed out"
                    );
                    ctx.interrupt_with(
                        ExecutionFailure::new(StatusCode::GATEWAY_TIMEOUT)
                            .key(keys::REQUEST_TIMEOUT)
                            .message("Request timeout"),
                    );
                }
            }
            None => self.execute(ctx, platform).await,
        }

        // platform response flows run whatever happened before
        ctx.resume();
        platform.execute(ctx, Phase::Response).await;
        ctx.resume();

        if ctx.failure().is_none() {
            let entrypoint = ctx
                .internal_attribute::<Arc<dyn EntrypointConnector>>(internal::ENTRYPOINT_CONNECTOR)
                .cloned();
            if let Some(entrypoint) = entrypoint {
                if let Err(e) = entrypoint.handle_response(ctx).await {
                    ctx.interrupt_with(connector_failure(&e));
                }
            }
        }

        if let Some(cors) = &self.cors {
            cors.handle_response(ctx);
        }
    }

    /// Request phase, invocation and API response phase; returns early on interruption.
    async fn execute(&self, ctx: &mut ExecutionContext, platform: &FlowChain) {
        let mut preflight = false;
        if let Some(cors) = &self.cors {
            match cors.handle_request(ctx) {
                CorsOutcome::Continue => {}
                CorsOutcome::PreflightAnswered | CorsOutcome::Rejected(_) => return,
                CorsOutcome::PreflightWithPolicies => preflight = true,
            }
        }

        if !platform.execute(ctx, Phase::Request).await.is_completed() {
            return;
        }

        if !ctx.internal_flag(internal::SECURITY_SKIP)
            && !self.security.execute(ctx).await.is_completed()
        {
            return;
        }

        if !preflight {
            let Some(entrypoint) = self.entrypoints.resolve(ctx) else {
                ctx.interrupt_with(
                    ExecutionFailure::new(StatusCode::NOT_FOUND)
                        .key(keys::NO_ENTRYPOINT)
                        .message("No entrypoint matches the incoming request"),
                );
                return;
            };
            ctx.set_internal_attribute(internal::ENTRYPOINT_CONNECTOR, entrypoint.clone());
            if let Err(e) = entrypoint.handle_request(ctx).await {
                ctx.interrupt_with(connector_failure(&e));
                return;
            }
        }

        let plan_chain = ctx
            .attribute_str(attributes::ATTR_PLAN)
            .and_then(|plan| self.plan_chains.get(plan));

        if let Some(chain) = plan_chain {
            if !chain.execute(ctx, Phase::Request).await.is_completed() {
                return;
            }
        }
        if !self.api_chain.execute(ctx, Phase::Request).await.is_completed() {
            return;
        }

        if let Err(failure) = self.invoker.invoke(ctx).await {
            ctx.interrupt_with(failure);
            return;
        }

        if let Some(chain) = plan_chain {
            if !chain.execute(ctx, Phase::Response).await.is_completed() {
                return;
            }
        }
        self.api_chain.execute(ctx, Phase::Response).await;
    }
}

/// Outcome of a [`Reactor::synchronize`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub deployed: usize,
    pub undeployed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Owns the deployed APIs and drives every request through the pipeline.
pub struct Reactor {
    shared: SharedServices,
    metadata: DeploymentMetadata,
    platform: FlowChain,
    reporters: Vec<Arc<dyn Reporter>>,
    apis: scc::HashMap<String, Arc<ApiReactor>>,
    acceptors: ArcSwap<AcceptorTable<ApiReactor>>,
    deploy_lock: tokio::sync::Mutex<()>,
}

impl Reactor {
    pub fn builder(config: GatewayConfig) -> ReactorBuilder {
        ReactorBuilder::new(config)
    }

    /// Deploy or replace an API. A disabled API is undeployed.
    pub async fn deploy(&self, api: ApiDefinition) -> Result<(), ReactorError> {
        let _guard = self.deploy_lock.lock().await;
        self.deploy_locked(api).await
    }

    pub async fn update(&self, api: ApiDefinition) -> Result<(), ReactorError> {
        self.deploy(api).await
    }

    pub async fn undeploy(&self, api_id: &str) -> bool {
        let _guard = self.deploy_lock.lock().await;
        self.undeploy_locked(api_id).await
    }

    async fn deploy_locked(&self, api: ApiDefinition) -> Result<(), ReactorError> {
        if !api.enabled {
            info!(api.id = %api.id, "API is disabled");
            self.undeploy_locked(&api.id).await;
            return Ok(());
        }

        DefinitionValidator::validate_api(&api)?;
        let reactor = Arc::new(ApiReactor::new(api, &self.shared)?);
        let api_id = reactor.id().to_string();
        let replaced = self.apis.remove_async(&api_id).await.is_some();
        let _ = self.apis.insert_async(api_id.clone(), reactor).await;
        self.rebuild_acceptors().await;

        if replaced {
            info!(api.id = %api_id, "API updated");
        } else {
            info!(api.id = %api_id, "API deployed");
        }
        Ok(())
    }

    async fn undeploy_locked(&self, api_id: &str) -> bool {
        let removed = self.apis.remove_async(api_id).await.is_some();
        if removed {
            self.rebuild_acceptors().await;
            info!(api.id = %api_id, "API undeployed");
        }
        removed
    }

    /// Bring the deployed set in line with `definitions`: new and changed APIs are
    /// deployed, missing ones undeployed. Invalid definitions are logged and skipped.
    pub async fn synchronize(&self, definitions: Vec<ApiDefinition>) -> SyncReport {
        let _guard = self.deploy_lock.lock().await;
        let mut report = SyncReport::default();

        let wanted: HashSet<String> = definitions.iter().map(|api| api.id.clone()).collect();
        for api in self.deployed().await {
            if !wanted.contains(api.id()) && self.undeploy_locked(api.id()).await {
                report.undeployed += 1;
            }
        }

        for definition in definitions {
            let unchanged = self
                .apis
                .read_async(&definition.id, |_, api| api.definition() == &definition)
                .await
                .unwrap_or(false);
            if unchanged {
                report.unchanged += 1;
                continue;
            }

            let api_id = definition.id.clone();
            match self.deploy_locked(definition).await {
                Ok(()) => report.deployed += 1,
                Err(e) => {
                    error!(api.id = %api_id, error = %e, "Unable to deploy API");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Deployed APIs, ordered by id
    pub async fn deployed(&self) -> Vec<Arc<ApiReactor>> {
        let mut deployed = Vec::with_capacity(self.apis.len());
        self.apis
            .retain_async(|_, api| {
                deployed.push(api.clone());
                true
            })
            .await;
        deployed.sort_by(|a, b| a.id().cmp(b.id()));
        deployed
    }

    pub async fn api(&self, api_id: &str) -> Option<Arc<ApiReactor>> {
        self.apis.read_async(api_id, |_, api| api.clone()).await
    }

    async fn rebuild_acceptors(&self) {
        let acceptors: Vec<HttpAcceptor<ApiReactor>> = self
            .deployed()
            .await
            .into_iter()
            .flat_map(|api| {
                api.definition()
                    .listeners
                    .iter()
                    .map(|listener| HttpAcceptor::new(listener.host.as_deref(), &listener.path, api.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        debug!(acceptors = acceptors.len(), "Acceptor table rebuilt");
        self.acceptors.store(Arc::new(AcceptorTable::new(acceptors)));
    }

    pub async fn handle(&self, request: Request<Body>, remote_addr: Option<SocketAddr>) -> Response<Body> {
        self.handle_with_completion(request, remote_addr, None).await
    }

    /// Handle a request; `completion` fires once the client has the whole response (for
    /// upgraded WebSocket sessions, once the session is closed).
    pub async fn handle_with_completion(
        &self,
        request: Request<Body>,
        remote_addr: Option<SocketAddr>,
        completion: Option<Completion>,
    ) -> Response<Body> {
        let started = Instant::now();
        let mut ctx = ExecutionContext::new(request, remote_addr).with_metadata(self.metadata.clone());
        if let Some(completion) = completion {
            ctx.set_internal_attribute(internal::COMPLETION, completion);
        }

        let span = create_request_span(
            ctx.request().method().as_str(),
            ctx.request().path(),
            ctx.request().id(),
        );

        async move {
            // reports and completes the request if the client goes away before the funnel
            let mut in_flight = InFlight {
                reactor: self,
                ctx: Some(ctx),
                started,
            };
            if let Some(ctx) = in_flight.ctx.as_mut() {
                self.dispatch(ctx).await;
            }
            in_flight.finish()
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, ctx: &mut ExecutionContext) {
        let matched = {
            let table = self.acceptors.load();
            table
                .resolve(ctx.request().host(), ctx.request().path())
                .map(|acceptor| (acceptor.target().clone(), acceptor.context_path().to_string()))
        };

        let Some((api, context_path)) = matched else {
            debug!(request.id = %ctx.request().id(), path = %ctx.request().path(), "No acceptor matches the request");
            ctx.interrupt_with(
                ExecutionFailure::new(StatusCode::NOT_FOUND)
                    .key(keys::NO_CONTEXT_PATH)
                    .message(NOT_FOUND_MESSAGE),
            );
            return;
        };

        tracing::Span::current().record("api.id", api.id());
        ctx.request_mut().set_context_path(&context_path);
        let handled = AssertUnwindSafe(api.handle(ctx, &self.platform))
            .catch_unwind()
            .await;
        if let Err(panic) = handled {
            error!(
                request.id = %ctx.request().id(),
                api.id = %api.id(),
                panic = panic_message(panic.as_ref()),
                "Request processing panicked"
            );
            ctx.resume();
            ctx.interrupt_with(ExecutionFailure::internal());
        }
    }

    /// Single exit point of every answered request: renders a recorded failure, stamps
    /// ids and reports. The completion is bound to the end of the response body.
    fn funnel(&self, mut ctx: ExecutionContext, started: Instant) -> Response<Body> {
        let failure = ctx.take_failure();
        if let Some(failure) = &failure {
            render_failure(&mut ctx, failure);
        }

        let request_id = ctx.request().id().to_string();
        let transaction_id = ctx.request().transaction_id().to_string();
        let headers = ctx.response_mut().headers_mut();
        insert_header(headers, REQUEST_ID_HEADER, &request_id);
        insert_header(headers, TRANSACTION_ID_HEADER, &transaction_id);

        let status = ctx.response().status();
        let duration = started.elapsed();
        let span = tracing::Span::current();
        span.record("http.status_code", status.as_u16());
        span.record("duration_ms", duration.as_millis() as u64);

        self.report(&ctx, status.as_u16(), failure.as_ref(), duration);

        let mut body = ctx.response_mut().take_body();
        if let Some(completion) = ctx.internal_attribute::<Completion>(internal::COMPLETION) {
            body = completion.clone().on_body_end(body);
        }
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = std::mem::take(ctx.response_mut().headers_mut());
        response
    }

    fn report(&self, ctx: &ExecutionContext, status: u16, failure: Option<&ExecutionFailure>, duration: Duration) {
        let metrics = RequestMetrics {
            request_id: ctx.request().id().to_string(),
            transaction_id: ctx.request().transaction_id().to_string(),
            timestamp: ctx.request().timestamp(),
            api_id: ctx.attribute_str(attributes::ATTR_API).map(str::to_string),
            plan_id: ctx.attribute_str(attributes::ATTR_PLAN).map(str::to_string),
            method: ctx.request().method().to_string(),
            path: ctx.request().path().to_string(),
            host: ctx.request().host().map(str::to_string),
            remote_addr: ctx.request().remote_addr(),
            status,
            endpoint: ctx.internal_attribute::<String>(internal::ENDPOINT).cloned(),
            failure_key: failure.and_then(|f| f.key.clone()),
            failure_message: failure.map(|f| f.display_message()),
            duration,
            tenant: self.metadata.tenant.clone(),
            zone: self.metadata.zone.clone(),
        };
        for reporter in &self.reporters {
            reporter.report(&metrics);
        }
    }
}

/// Non-standard status reported for requests abandoned by the client
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Holds the context of a request until the funnel takes it. Dropped earlier, the client
/// went away: the request is reported as aborted, its context cancelled and completed.
struct InFlight<'a> {
    reactor: &'a Reactor,
    ctx: Option<ExecutionContext>,
    started: Instant,
}

impl InFlight<'_> {
    fn finish(mut self) -> Response<Body> {
        match self.ctx.take() {
            Some(ctx) => self.reactor.funnel(ctx, self.started),
            None => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let Some(ctx) = self.ctx.take() else {
            return;
        };
        ctx.cancellation().cancel();
        debug!(request.id = %ctx.request().id(), "Client went away before the response was produced");

        let failure = ExecutionFailure::new(StatusCode::BAD_REQUEST)
            .key(keys::CLIENT_ABORTED)
            .message("Client closed the request");
        self.reactor
            .report(&ctx, CLIENT_CLOSED_REQUEST, Some(&failure), self.started.elapsed());
        if let Some(completion) = ctx.internal_attribute::<Completion>(internal::COMPLETION) {
            completion.complete();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Replace the response with the failure: JSON `{message, http_status_code}` unless the
/// failure carries its own content type.
fn render_failure(ctx: &mut ExecutionContext, failure: &ExecutionFailure) {
    let message = failure.display_message();
    let response = ctx.response_mut();
    response.set_status(failure.status);
    response.take_messages();
    response.headers_mut().remove(header::CONTENT_LENGTH);

    match &failure.content_type {
        Some(content_type) => {
            insert_header(response.headers_mut(), header::CONTENT_TYPE.as_str(), content_type);
            response.set_body(Body::from(message));
        }
        None => {
            let body = serde_json::to_vec(&FailureBody {
                message: &message,
                http_status_code: failure.status_code(),
            })
            .unwrap_or_default();
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response.set_body(Body::from(body));
        }
    }
}

/// Assembles a [`Reactor`] from the gateway configuration and the installed plugins.
pub struct ReactorBuilder {
    config: GatewayConfig,
    policies: PolicyRegistry,
    connectors: ConnectorRegistry,
    hooks: Vec<Arc<dyn Hook>>,
    reporters: Vec<Arc<dyn Reporter>>,
    components: ComponentRegistry,
    template_providers: Vec<Arc<dyn TemplateVariableProvider>>,
}

impl ReactorBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            policies: PolicyRegistry::new(),
            connectors: ConnectorRegistry::new(),
            hooks: Vec::new(),
            reporters: Vec::new(),
            components: ComponentRegistry::new(),
            template_providers: Vec::new(),
        }
    }

    pub fn policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    pub fn connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    /// Component shared by every deployed API
    pub fn component<T: std::any::Any + Send + Sync>(mut self, component: Arc<T>) -> Self {
        self.components.register(component);
        self
    }

    pub fn template_provider(mut self, provider: Arc<dyn TemplateVariableProvider>) -> Self {
        self.template_providers.push(provider);
        self
    }

    pub fn build(self) -> Reactor {
        let hooks = HookSet::new(self.hooks);
        let policies = Arc::new(self.policies);
        let platform = FlowChain::new(
            "platform",
            FlowResolver::new(
                &self.config.platform_flows,
                FlowStage::Platform,
                self.config.platform_flow_mode,
            ),
            Arc::new(PolicyManager::new(policies.clone())),
            hooks.clone(),
        );

        Reactor {
            shared: SharedServices {
                policies,
                connectors: Arc::new(self.connectors),
                hooks,
                components: self.components,
                template_providers: self.template_providers,
                request_timeout: self.config.request_timeout_secs.map(Duration::from_secs),
            },
            metadata: DeploymentMetadata {
                tenant: self.config.tenant.clone(),
                zone: self.config.zone.clone(),
            },
            platform,
            reporters: self.reporters,
            apis: scc::HashMap::new(),
            acceptors: ArcSwap::from_pointee(AcceptorTable::default()),
            deploy_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use futures_util::StreamExt;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        config::models::{ApiType, ConnectorMode, EntrypointDefinition},
        ports::{
            connector::{EndpointConfiguration, EndpointConnector, EndpointConnectorFactory, EntrypointConnectorFactory},
            policy::{Policy, PolicyFactory, PolicyResult},
        },
    };

    #[derive(Default)]
    struct CollectingReporter {
        reports: Mutex<Vec<RequestMetrics>>,
    }

    impl Reporter for CollectingReporter {
        fn name(&self) -> &str {
            "collecting"
        }

        fn report(&self, metrics: &RequestMetrics) {
            self.reports.lock().unwrap().push(metrics.clone());
        }
    }

    struct ProxyEntrypoint {
        modes: HashSet<ConnectorMode>,
    }

    #[async_trait]
    impl EntrypointConnector for ProxyEntrypoint {
        fn id(&self) -> &str {
            "http-proxy"
        }

        fn supported_api(&self) -> ApiType {
            ApiType::Proxy
        }

        fn supported_modes(&self) -> &HashSet<ConnectorMode> {
            &self.modes
        }

        fn matches(&self, ctx: &ExecutionContext) -> bool {
            ctx.request().header("x-no-entrypoint").is_none()
        }
    }

    struct ProxyEntrypointFactory;

    impl EntrypointConnectorFactory for ProxyEntrypointFactory {
        fn connector_type(&self) -> &str {
            "http-proxy"
        }

        fn create(&self, _definition: &EntrypointDefinition) -> Result<Arc<dyn EntrypointConnector>, ConnectorError> {
            Ok(Arc::new(ProxyEntrypoint {
                modes: [ConnectorMode::RequestResponse].into_iter().collect(),
            }))
        }
    }

    /// Answers with the endpoint name and the path it would call.
    struct EchoConnector {
        name: String,
        delay: Option<Duration>,
        streaming: bool,
        calls: Arc<AtomicUsize>,
        modes: HashSet<ConnectorMode>,
    }

    #[async_trait]
    impl EndpointConnector for EchoConnector {
        fn id(&self) -> &str {
            "echo"
        }

        fn supported_api(&self) -> ApiType {
            ApiType::Proxy
        }

        fn supported_modes(&self) -> &HashSet<ConnectorMode> {
            &self.modes
        }

        async fn connect(&self, ctx: &mut ExecutionContext) -> Result<(), ConnectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let body = format!("{}{}", self.name, ctx.request().path_info());
            ctx.response_mut().set_status(StatusCode::OK);
            if self.streaming {
                // first chunk, then a body that never ends
                let chunks = futures_util::stream::iter([Ok::<_, std::io::Error>(bytes::Bytes::from(body))])
                    .chain(futures_util::stream::pending());
                ctx.response_mut().set_body(Body::from_stream(chunks));
            } else {
                ctx.response_mut().set_body(Body::from(body));
            }
            Ok(())
        }
    }

    struct EchoFactory {
        calls: Arc<AtomicUsize>,
    }

    impl EndpointConnectorFactory for EchoFactory {
        fn connector_type(&self) -> &str {
            "echo"
        }

        fn create(&self, configuration: EndpointConfiguration<'_>) -> Result<Arc<dyn EndpointConnector>, ConnectorError> {
            Ok(Arc::new(EchoConnector {
                name: configuration.endpoint_name.to_string(),
                delay: configuration
                    .configuration
                    .get("delay_ms")
                    .and_then(Value::as_u64)
                    .map(Duration::from_millis),
                streaming: configuration
                    .configuration
                    .get("streaming")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                calls: self.calls.clone(),
                modes: [ConnectorMode::RequestResponse].into_iter().collect(),
            }))
        }
    }

    struct DenyPolicy;

    #[async_trait]
    impl Policy for DenyPolicy {
        fn id(&self) -> &str {
            "deny"
        }

        async fn on_request(&self, _ctx: &mut ExecutionContext) -> Result<PolicyResult, PolicyError> {
            Ok(PolicyResult::InterruptWith(
                ExecutionFailure::new(StatusCode::FORBIDDEN).key("DENIED").message("Denied"),
            ))
        }
    }

    struct DenyFactory;

    impl PolicyFactory for DenyFactory {
        fn policy_id(&self) -> &str {
            "deny"
        }

        fn create(&self, _configuration: &Value) -> Result<Arc<dyn Policy>, PolicyError> {
            Ok(Arc::new(DenyPolicy))
        }
    }

    struct PanicPolicy;

    #[async_trait]
    impl Policy for PanicPolicy {
        fn id(&self) -> &str {
            "panic"
        }

        async fn on_request(&self, _ctx: &mut ExecutionContext) -> Result<PolicyResult, PolicyError> {
            panic!("policy bug")
        }
    }

    struct PanicFactory;

    impl PolicyFactory for PanicFactory {
        fn policy_id(&self) -> &str {
            "panic"
        }

        fn create(&self, _configuration: &Value) -> Result<Arc<dyn Policy>, PolicyError> {
            Ok(Arc::new(PanicPolicy))
        }
    }

    fn counting_completion() -> (Arc<AtomicUsize>, Completion) {
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = completions.clone();
        let completion = Completion::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (completions, completion)
    }

    struct Fixture {
        reactor: Reactor,
        reporter: Arc<CollectingReporter>,
        calls: Arc<AtomicUsize>,
    }

    fn fixture(config: GatewayConfig) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let reporter = Arc::new(CollectingReporter::default());
        let mut connectors = ConnectorRegistry::new();
        connectors.register_entrypoint(Arc::new(ProxyEntrypointFactory));
        connectors.register_endpoint(Arc::new(EchoFactory { calls: calls.clone() }));
        let mut policies = PolicyRegistry::new();
        policies.register(Arc::new(DenyFactory));
        policies.register(Arc::new(PanicFactory));

        let reactor = Reactor::builder(config)
            .connectors(connectors)
            .policies(policies)
            .reporter(reporter.clone())
            .build();
        Fixture {
            reactor,
            reporter,
            calls,
        }
    }

    fn api(id: &str, path: &str, extra: Value) -> ApiDefinition {
        let mut definition = json!({
            "id": id,
            "listeners": [{ "path": path }],
            "endpoint_groups": [{
                "name": "default",
                "type": "echo",
                "endpoints": [{ "name": id }]
            }]
        });
        if let (Some(target), Some(extra)) = (definition.as_object_mut(), extra.as_object()) {
            target.extend(extra.clone());
        }
        serde_json::from_value(definition).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_unmatched_request_is_a_deterministic_404() {
        let fixture = fixture(GatewayConfig::default());
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = completions.clone();

        let response = fixture
            .reactor
            .handle_with_completion(
                get("/nowhere"),
                None,
                Some(Completion::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        assert_eq!(
            body_string(response).await,
            r#"{"message":"No context-path matches the request URI.","http_status_code":404}"#
        );
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        let reports = fixture.reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].failure_key.as_deref(), Some(keys::NO_CONTEXT_PATH));
    }

    #[tokio::test]
    async fn test_deploy_route_and_undeploy() {
        let fixture = fixture(GatewayConfig::default());
        fixture.reactor.deploy(api("orders", "/orders", json!({}))).await.unwrap();
        fixture.reactor.deploy(api("orders-v2", "/orders/v2", json!({}))).await.unwrap();

        let response = fixture.reactor.handle(get("/orders/v2/42"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "orders-v2/42");

        let response = fixture.reactor.handle(get("/orders/1"), None).await;
        assert_eq!(body_string(response).await, "orders/1");

        assert!(fixture.reactor.undeploy("orders-v2").await);
        let response = fixture.reactor.handle(get("/orders/v2/42"), None).await;
        assert_eq!(body_string(response).await, "orders/v2/42");
        assert!(!fixture.reactor.undeploy("orders-v2").await);

        let reports = fixture.reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].api_id.as_deref(), Some("orders-v2"));
        assert_eq!(reports[0].endpoint.as_deref(), Some("default:orders-v2"));
    }

    #[tokio::test]
    async fn test_disabled_api_is_not_accepted() {
        let fixture = fixture(GatewayConfig::default());
        fixture.reactor.deploy(api("orders", "/orders", json!({}))).await.unwrap();
        fixture
            .reactor
            .update(api("orders", "/orders", json!({ "enabled": false })))
            .await
            .unwrap();

        let response = fixture.reactor.handle(get("/orders"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(fixture.reactor.deployed().await.is_empty());
    }

    #[tokio::test]
    async fn test_policy_failure_is_rendered_without_invocation() {
        let fixture = fixture(GatewayConfig::default());
        fixture
            .reactor
            .deploy(api(
                "orders",
                "/orders",
                json!({ "flows": [{ "request": [{ "policy": "deny" }] }] }),
            ))
            .await
            .unwrap();

        let response = fixture.reactor.handle(get("/orders"), None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(body_string(response).await, r#"{"message":"Denied","http_status_code":403}"#);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_platform_flows_run_before_api_flows() {
        let config = GatewayConfig {
            platform_flows: serde_json::from_value(json!([
                { "selector": { "path": "/admin" }, "request": [{ "policy": "deny" }] }
            ]))
            .unwrap(),
            ..GatewayConfig::default()
        };
        let fixture = fixture(config);
        fixture.reactor.deploy(api("root", "/", json!({}))).await.unwrap();

        assert_eq!(
            fixture.reactor.handle(get("/admin/users"), None).await.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(fixture.reactor.handle(get("/public"), None).await.status(), StatusCode::OK);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_entrypoint_is_404() {
        let fixture = fixture(GatewayConfig::default());
        fixture.reactor.deploy(api("orders", "/orders", json!({}))).await.unwrap();

        let request = Request::builder()
            .uri("/orders")
            .header("x-no-entrypoint", "1")
            .body(Body::empty())
            .unwrap();
        let response = fixture.reactor.handle(request, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_string(response).await,
            r#"{"message":"No entrypoint matches the incoming request","http_status_code":404}"#
        );
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let fixture = fixture(GatewayConfig::default());
        let mut definition = api("slow", "/slow", json!({ "request_timeout_secs": 1 }));
        definition.endpoint_groups[0].endpoints[0].configuration = json!({ "delay_ms": 5000 });
        fixture.reactor.deploy(definition).await.unwrap();

        let response = fixture.reactor.handle(get("/slow"), None).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let reports = fixture.reporter.reports.lock().unwrap();
        assert_eq!(reports[0].failure_key.as_deref(), Some(keys::REQUEST_TIMEOUT));
    }

    #[tokio::test]
    async fn test_completion_fires_at_the_end_of_a_streamed_body() {
        let fixture = fixture(GatewayConfig::default());
        let mut definition = api("feed", "/feed", json!({}));
        definition.endpoint_groups[0].endpoints[0].configuration = json!({ "streaming": true });
        fixture.reactor.deploy(definition).await.unwrap();

        let (completions, completion) = counting_completion();
        let mut response = fixture
            .reactor
            .handle_with_completion(get("/feed/items"), None, Some(completion))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(completions.load(Ordering::SeqCst), 0);

        let frame = response.body_mut().frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "feed/items");
        assert_eq!(completions.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.reporter.reports.lock().unwrap().len(), 1);

        drop(response);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_client_gone_before_the_response_is_reported_and_completed() {
        let fixture = fixture(GatewayConfig::default());
        let mut definition = api("slow", "/slow", json!({}));
        definition.endpoint_groups[0].endpoints[0].configuration = json!({ "delay_ms": 5000 });
        fixture.reactor.deploy(definition).await.unwrap();

        let (completions, completion) = counting_completion();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            fixture.reactor.handle_with_completion(get("/slow"), None, Some(completion)),
        )
        .await;
        assert!(abandoned.is_err());

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        let reports = fixture.reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, 499);
        assert_eq!(reports[0].failure_key.as_deref(), Some(keys::CLIENT_ABORTED));
        assert_eq!(reports[0].api_id.as_deref(), Some("slow"));
    }

    #[tokio::test]
    async fn test_panicking_policy_is_rendered_as_internal_error() {
        let fixture = fixture(GatewayConfig::default());
        fixture
            .reactor
            .deploy(api(
                "orders",
                "/orders",
                json!({ "flows": [{ "request": [{ "policy": "panic" }] }] }),
            ))
            .await
            .unwrap();

        let (completions, completion) = counting_completion();
        let response = fixture
            .reactor
            .handle_with_completion(get("/orders"), None, Some(completion))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_string(response).await,
            r#"{"message":"Internal Server Error","http_status_code":500}"#
        );
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);

        let reports = fixture.reporter.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].failure_key.as_deref(), Some(keys::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn test_cors_preflight_short_circuits() {
        let fixture = fixture(GatewayConfig::default());
        fixture
            .reactor
            .deploy(api(
                "orders",
                "/orders",
                json!({ "cors": { "allow_origin": ["https://a.com"], "allow_methods": ["GET"] } }),
            ))
            .await
            .unwrap();

        let request = Request::builder()
            .method("OPTIONS")
            .uri("/orders")
            .header("origin", "https://a.com")
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .unwrap();
        let response = fixture.reactor.handle(request, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["access-control-allow-origin"], "https://a.com");
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_synchronize() {
        let fixture = fixture(GatewayConfig::default());
        let report = fixture
            .reactor
            .synchronize(vec![api("a", "/a", json!({})), api("b", "/b", json!({}))])
            .await;
        assert_eq!(report.deployed, 2);
        let a = fixture.reactor.api("a").await.unwrap();
        assert_eq!(a.dependencies().connectors.iter().collect::<Vec<_>>(), vec!["echo", "http-proxy"]);

        let mut invalid = api("c", "/c", json!({}));
        invalid.listeners.clear();
        let report = fixture
            .reactor
            .synchronize(vec![api("a", "/a", json!({})), invalid])
            .await;
        assert_eq!(
            report,
            SyncReport {
                deployed: 0,
                undeployed: 1,
                unchanged: 1,
                failed: 1
            }
        );
        let ids: Vec<String> = fixture
            .reactor
            .deployed()
            .await
            .iter()
            .map(|api| api.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a"]);
    }
}
