use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_true() -> bool {
    true
}

/// Gateway-wide configuration: listener, deployment metadata and the platform flows
/// applied to every deployed API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    /// Address the gateway listens on, e.g. `0.0.0.0:8082`
    pub listen_addr: String,

    /// Tenant this gateway instance serves
    #[serde(default)]
    pub tenant: Option<String>,

    /// Zone this gateway instance runs in
    #[serde(default)]
    pub zone: Option<String>,

    /// Upper bound on the whole request pipeline, in seconds
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    /// Flows executed for every API before (request) and after (response) the API flows
    #[serde(default)]
    pub platform_flows: Vec<FlowDefinition>,

    #[serde(default)]
    pub platform_flow_mode: FlowMode,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Emit a tracing event for every hook call site
    #[serde(default)]
    pub tracing_hooks: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8082".to_string(),
            tenant: None,
            zone: None,
            request_timeout_secs: None,
            platform_flows: Vec::new(),
            platform_flow_mode: FlowMode::Default,
            health_check: HealthCheckConfig::default(),
            logging: LoggingConfig::default(),
            tracing_hooks: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON output instead of the human readable format
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Health check configuration for HTTP endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_health_check_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_health_check_timeout")]
    pub timeout_secs: u64,

    /// Path appended to the endpoint target when probing
    #[serde(default = "default_health_check_path")]
    pub path: String,

    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
}

fn default_health_check_interval() -> u64 {
    10
}

fn default_health_check_timeout() -> u64 {
    5
}

fn default_health_check_path() -> String {
    "/".to_string()
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    2
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_health_check_interval(),
            timeout_secs: default_health_check_timeout(),
            path: default_health_check_path(),
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
        }
    }
}

/// A deployable API definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiDefinition {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub api_type: ApiType,

    /// Host/path pairs the API accepts requests on
    pub listeners: Vec<ListenerDefinition>,

    /// Entrypoint connectors; defaults to `http-proxy` or `http-get` by API type
    #[serde(default)]
    pub entrypoints: Vec<EntrypointDefinition>,

    #[serde(default)]
    pub flows: Vec<FlowDefinition>,

    #[serde(default)]
    pub flow_mode: FlowMode,

    #[serde(default)]
    pub plans: Vec<PlanDefinition>,

    pub endpoint_groups: Vec<EndpointGroupDefinition>,

    #[serde(default)]
    pub cors: Option<CorsConfig>,

    /// Key/value pairs exposed to templates as `api.properties`
    #[serde(default)]
    pub properties: HashMap<String, String>,

    /// Overrides the gateway-wide request timeout
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl ApiDefinition {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Entrypoints to instantiate, falling back to the API type's default connector.
    pub fn effective_entrypoints(&self) -> Vec<EntrypointDefinition> {
        if !self.entrypoints.is_empty() {
            return self.entrypoints.clone();
        }
        let kind = match self.api_type {
            ApiType::Proxy => "http-proxy",
            ApiType::Message => "http-get",
        };
        vec![EntrypointDefinition {
            kind: kind.to_string(),
            qos: None,
            configuration: Value::Null,
        }]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    #[default]
    Proxy,
    Message,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorMode {
    RequestResponse,
    Subscribe,
    Publish,
}

/// Delivery guarantee requested by an entrypoint and offered by an endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    None,
    Auto,
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QosCapability {
    Auto,
    ManualAck,
    Recover,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerDefinition {
    /// Virtual host; `*.example.com` matches any subdomain
    #[serde(default)]
    pub host: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntrypointDefinition {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub qos: Option<Qos>,

    #[serde(default)]
    pub configuration: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowMode {
    #[default]
    Default,
    BestMatch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PathOperator {
    #[default]
    StartsWith,
    Equals,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FlowDefinition {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub selector: FlowSelector,

    /// Steps executed during the request phase
    #[serde(default)]
    pub request: Vec<StepDefinition>,

    /// Steps executed during the response phase
    #[serde(default)]
    pub response: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowSelector {
    #[serde(default = "default_flow_path")]
    pub path: String,

    #[serde(default)]
    pub path_operator: PathOperator,

    /// Empty means any method
    #[serde(default)]
    pub methods: Vec<String>,

    #[serde(default)]
    pub condition: Option<String>,
}

fn default_flow_path() -> String {
    "/".to_string()
}

impl Default for FlowSelector {
    fn default() -> Self {
        Self {
            path: default_flow_path(),
            path_operator: PathOperator::StartsWith,
            methods: Vec::new(),
            condition: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    pub policy: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub condition: Option<String>,

    #[serde(default)]
    pub configuration: Value,
}

impl StepDefinition {
    pub fn new(policy: impl Into<String>, configuration: Value) -> Self {
        Self {
            policy: policy.into(),
            name: None,
            enabled: true,
            condition: None,
            configuration,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanDefinition {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    pub security: PlanSecurity,

    #[serde(default)]
    pub mode: PlanMode,

    /// Extra condition a request must satisfy for this plan to be selected
    #[serde(default)]
    pub selection_rule: Option<String>,

    #[serde(default)]
    pub flows: Vec<FlowDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanSecurity {
    #[serde(rename = "type")]
    pub kind: SecurityType,

    #[serde(default)]
    pub configuration: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityType {
    Keyless,
    ApiKey,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    #[default]
    Standard,
    Push,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointGroupDefinition {
    pub name: String,

    /// Endpoint connector type id, e.g. `http-proxy` or `mock`
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub load_balancer: LoadBalanceStrategy,

    /// Connector options shared by the group's endpoints
    #[serde(default)]
    pub shared_configuration: Value,

    #[serde(default)]
    pub endpoints: Vec<EndpointDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointDefinition {
    pub name: String,

    /// Connector type id; defaults to the group's type
    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Backup endpoints are only selected when no primary endpoint is available
    #[serde(default)]
    pub backup: bool,

    #[serde(default)]
    pub configuration: Value,

    /// Use the group's shared configuration instead of `shared_configuration_override`
    #[serde(default = "default_true")]
    pub inherit_configuration: bool,

    #[serde(default)]
    pub shared_configuration_override: Value,
}

fn default_weight() -> u32 {
    1
}

/// Load balancing strategy for an endpoint group
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
    WeightedRoundRobin,
    WeightedRandom,
}

/// Cross-origin resource sharing settings of an API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Allowed origins: `*`, exact values or anchored regular expressions
    #[serde(default)]
    pub allow_origin: Vec<String>,

    #[serde(default)]
    pub allow_methods: Vec<String>,

    #[serde(default)]
    pub allow_headers: Vec<String>,

    #[serde(default)]
    pub expose_headers: Vec<String>,

    #[serde(default)]
    pub allow_credentials: bool,

    /// `Access-Control-Max-Age` in seconds; negative disables the header
    #[serde(default = "default_max_age")]
    pub max_age: i64,

    /// Continue the policy chain (without security) for accepted preflights
    #[serde(default)]
    pub run_policies: bool,

    #[serde(default = "default_cors_error_status")]
    pub error_status_code: u16,
}

fn default_max_age() -> i64 {
    -1
}

fn default_cors_error_status() -> u16 {
    400
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_origin: Vec::new(),
            allow_methods: Vec::new(),
            allow_headers: Vec::new(),
            expose_headers: Vec::new(),
            allow_credentials: false,
            max_age: default_max_age(),
            run_policies: false,
            error_status_code: default_cors_error_status(),
        }
    }
}

/// Options of the HTTP client used by `http-proxy` endpoints (group shared configuration).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpClientOptions {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Headers added to every request sent to the endpoint
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            headers: HashMap::new(),
        }
    }
}
