#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr};

use regex::Regex;

use crate::config::models::{
    ApiDefinition, CorsConfig, EndpointGroupDefinition, FlowDefinition, GatewayConfig,
    HealthCheckConfig, PlanDefinition, SecurityType,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Listener conflict detected: {message}")]
    ListenerConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Validates the gateway configuration and API definitions before they are deployed.
pub struct DefinitionValidator;

impl DefinitionValidator {
    /// Validate the gateway-wide configuration
    pub fn validate_gateway(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.request_timeout_secs == Some(0) {
            errors.push(ValidationError::InvalidField {
                field: "request_timeout_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        for (index, flow) in config.platform_flows.iter().enumerate() {
            Self::validate_flow(&format!("platform_flows[{index}]"), flow, &mut errors);
        }

        Self::validate_health_check_config(&config.health_check, &mut errors);

        Self::finish(errors)
    }

    /// Validate a single API definition
    pub fn validate_api(api: &ApiDefinition) -> ValidationResult<()> {
        let mut errors = Vec::new();
        Self::collect_api_errors(api, &mut errors);
        Self::finish(errors)
    }

    /// Validate a set of API definitions, including conflicts between them
    pub fn validate_apis(apis: &[ApiDefinition]) -> ValidationResult<()> {
        let mut errors = Vec::new();
        let mut ids = HashSet::new();

        for api in apis {
            if !ids.insert(api.id.as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: "id".to_string(),
                    message: format!("Duplicate API id '{}'", api.id),
                });
            }
            Self::collect_api_errors(api, &mut errors);
        }

        Self::check_listener_conflicts(apis, &mut errors);

        Self::finish(errors)
    }

    fn collect_api_errors(api: &ApiDefinition, errors: &mut Vec<ValidationError>) {
        if api.id.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "id".to_string(),
            });
        }
        let scope = format!("api '{}'", api.id);

        if api.listeners.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("{scope} listeners"),
            });
        }
        for listener in &api.listeners {
            if !listener.path.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("{scope} listener path '{}'", listener.path),
                    message: "Listener paths must start with '/'".to_string(),
                });
            }
            if let Some(host) = &listener.host {
                if let Err(e) = Self::validate_host(host, &scope) {
                    errors.push(e);
                }
            }
        }

        if api.request_timeout_secs == Some(0) {
            errors.push(ValidationError::InvalidField {
                field: format!("{scope} request_timeout_secs"),
                message: "Must be greater than 0".to_string(),
            });
        }

        for (index, flow) in api.flows.iter().enumerate() {
            Self::validate_flow(&format!("{scope} flows[{index}]"), flow, errors);
        }

        let mut plan_ids = HashSet::new();
        for plan in &api.plans {
            if !plan_ids.insert(plan.id.as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: format!("{scope} plans"),
                    message: format!("Duplicate plan id '{}'", plan.id),
                });
            }
            Self::validate_plan(&scope, plan, errors);
        }

        Self::validate_endpoint_groups(&scope, &api.endpoint_groups, errors);

        if let Some(cors) = &api.cors {
            Self::validate_cors(&scope, cors, errors);
        }
    }

    fn validate_flow(scope: &str, flow: &FlowDefinition, errors: &mut Vec<ValidationError>) {
        if !flow.selector.path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("{scope} selector.path"),
                message: "Flow paths must start with '/'".to_string(),
            });
        }

        for method in &flow.selector.methods {
            if method.parse::<http::Method>().is_err() {
                errors.push(ValidationError::InvalidField {
                    field: format!("{scope} selector.methods"),
                    message: format!("Invalid HTTP method '{method}'"),
                });
            }
        }

        for step in flow.request.iter().chain(flow.response.iter()) {
            if step.policy.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("{scope} step policy"),
                });
            }
        }
    }

    fn validate_plan(scope: &str, plan: &PlanDefinition, errors: &mut Vec<ValidationError>) {
        if plan.id.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("{scope} plan id"),
            });
        }

        if plan.security.kind == SecurityType::ApiKey {
            let has_keys = plan
                .security
                .configuration
                .get("keys")
                .and_then(|keys| keys.as_array())
                .is_some_and(|keys| !keys.is_empty());
            if !has_keys {
                errors.push(ValidationError::InvalidField {
                    field: format!("{scope} plan '{}' security.configuration.keys", plan.id),
                    message: "API key plans need at least one key".to_string(),
                });
            }
        }

        for (index, flow) in plan.flows.iter().enumerate() {
            Self::validate_flow(
                &format!("{scope} plan '{}' flows[{index}]", plan.id),
                flow,
                errors,
            );
        }
    }

    fn validate_endpoint_groups(
        scope: &str,
        groups: &[EndpointGroupDefinition],
        errors: &mut Vec<ValidationError>,
    ) {
        if groups.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("{scope} endpoint_groups"),
            });
            return;
        }

        let mut names = HashSet::new();
        for group in groups {
            if !names.insert(group.name.as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: format!("{scope} endpoint_groups"),
                    message: format!("Duplicate endpoint or group name '{}'", group.name),
                });
            }

            if group.endpoints.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("{scope} group '{}' endpoints", group.name),
                });
            }

            for endpoint in &group.endpoints {
                if !names.insert(endpoint.name.as_str()) {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{scope} group '{}'", group.name),
                        message: format!("Duplicate endpoint or group name '{}'", endpoint.name),
                    });
                }

                if endpoint.name.contains(':') {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{scope} endpoint '{}'", endpoint.name),
                        message: "Endpoint names cannot contain ':'".to_string(),
                    });
                }

                let kind = endpoint.kind.as_deref().unwrap_or(&group.kind);
                if kind == "http-proxy" {
                    match endpoint.configuration.get("target").and_then(|t| t.as_str()) {
                        Some(target) => {
                            if let Err(e) = Self::validate_url(
                                target,
                                &format!("{scope} endpoint '{}' target", endpoint.name),
                            ) {
                                errors.push(e);
                            }
                        }
                        None => errors.push(ValidationError::MissingField {
                            field: format!("{scope} endpoint '{}' configuration.target", endpoint.name),
                        }),
                    }
                }
            }
        }
    }

    fn validate_cors(scope: &str, cors: &CorsConfig, errors: &mut Vec<ValidationError>) {
        if !cors.enabled {
            return;
        }

        for origin in &cors.allow_origin {
            if origin != "*" && Regex::new(&format!("^{origin}$")).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: format!("{scope} cors.allow_origin"),
                    message: format!("Origin '{origin}' is neither a value nor a valid pattern"),
                });
            }
        }

        if http::StatusCode::from_u16(cors.error_status_code).is_err() {
            errors.push(ValidationError::InvalidField {
                field: format!("{scope} cors.error_status_code"),
                message: format!("Invalid status code {}", cors.error_status_code),
            });
        }
    }

    /// Two APIs cannot listen on the same host and path
    fn check_listener_conflicts(apis: &[ApiDefinition], errors: &mut Vec<ValidationError>) {
        let mut seen: HashSet<(Option<String>, String)> = HashSet::new();

        for api in apis.iter().filter(|api| api.enabled) {
            for listener in &api.listeners {
                let host = listener.host.as_ref().map(|h| h.to_lowercase());
                let path = format!("{}/", listener.path.trim_end_matches('/'));
                if !seen.insert((host.clone(), path)) {
                    let host_desc = host
                        .map(|h| format!(" (host: {h})"))
                        .unwrap_or_else(|| " (no host)".to_string());
                    errors.push(ValidationError::ListenerConflict {
                        message: format!(
                            "Path '{}'{host_desc} is declared by more than one API, last seen on '{}'",
                            listener.path, api.id
                        ),
                    });
                }
            }
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Validate an endpoint target URL
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be one of http, https, ws or wss, got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Validate a listener host, allowing a leading `*.` wildcard label
    fn validate_host(host: &str, scope: &str) -> ValidationResult<()> {
        if host.is_empty() {
            return Err(ValidationError::InvalidField {
                field: format!("{scope} listener host"),
                message: "Host cannot be empty".to_string(),
            });
        }

        if host.contains("://") {
            return Err(ValidationError::InvalidField {
                field: format!("{scope} listener host"),
                message: "Host should not contain protocol (e.g., use 'example.com' not 'http://example.com')".to_string(),
            });
        }

        let hostname = host.strip_prefix("*.").unwrap_or(host);
        let hostname_regex = Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?)*(:\d{1,5})?$").expect("invalid hostname regex");

        if !hostname_regex.is_match(hostname) {
            return Err(ValidationError::InvalidField {
                field: format!("{scope} listener host"),
                message: format!("Invalid hostname format: '{host}'"),
            });
        }

        Ok(())
    }

    fn validate_health_check_config(config: &HealthCheckConfig, errors: &mut Vec<ValidationError>) {
        if !config.enabled {
            return;
        }

        if config.interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.interval_secs".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.timeout_secs".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if !config.path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "health_check.path".to_string(),
                message: "Must start with '/'".to_string(),
            });
        }

        if config.unhealthy_threshold == 0 || config.healthy_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check thresholds".to_string(),
                message: "Thresholds must be greater than 0".to_string(),
            });
        }
    }

    fn finish(errors: Vec<ValidationError>) -> ValidationResult<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn minimal_valid_api(id: &str, path: &str) -> ApiDefinition {
        serde_json::from_value(json!({
            "id": id,
            "listeners": [{ "path": path }],
            "endpoint_groups": [{
                "name": "default-group",
                "type": "http-proxy",
                "endpoints": [{ "name": "default", "configuration": { "target": "http://localhost:3000" } }]
            }]
        }))
        .unwrap()
    }

    #[test]
    fn validate_accepts_minimal_api() {
        assert!(DefinitionValidator::validate_api(&minimal_valid_api("orders", "/orders")).is_ok());
    }

    #[test]
    fn validate_rejects_relative_listener_path() {
        let api = minimal_valid_api("orders", "orders");
        assert!(DefinitionValidator::validate_api(&api).is_err());
    }

    #[test]
    fn validate_rejects_missing_target() {
        let mut api = minimal_valid_api("orders", "/orders");
        api.endpoint_groups[0].endpoints[0].configuration = json!({});
        let err = DefinitionValidator::validate_api(&api).unwrap_err();
        assert!(err.to_string().contains("configuration.target"));
    }

    #[test]
    fn validate_rejects_duplicate_endpoint_names() {
        let mut api = minimal_valid_api("orders", "/orders");
        let endpoint = api.endpoint_groups[0].endpoints[0].clone();
        api.endpoint_groups[0].endpoints.push(endpoint);
        assert!(DefinitionValidator::validate_api(&api).is_err());
    }

    #[test]
    fn validate_rejects_api_key_plan_without_keys() {
        let mut api = minimal_valid_api("orders", "/orders");
        api.plans = serde_json::from_value(json!([
            { "id": "gold", "security": { "type": "api_key" } }
        ]))
        .unwrap();
        assert!(DefinitionValidator::validate_api(&api).is_err());
    }

    #[test]
    fn validate_accepts_wildcard_host() {
        let mut api = minimal_valid_api("orders", "/orders");
        api.listeners[0].host = Some("*.acme.com".to_string());
        assert!(DefinitionValidator::validate_api(&api).is_ok());
    }

    #[test]
    fn validate_detects_listener_conflicts_between_apis() {
        let apis = vec![
            minimal_valid_api("orders", "/orders"),
            minimal_valid_api("orders-v2", "/orders/"),
        ];
        let err = DefinitionValidator::validate_apis(&apis).unwrap_err();
        assert!(err.to_string().contains("more than one API"));
    }

    #[test]
    fn validate_rejects_zero_health_check_interval_when_enabled() {
        let mut config = GatewayConfig::default();
        config.health_check.enabled = true;
        config.health_check.interval_secs = 0;

        assert!(DefinitionValidator::validate_gateway(&config).is_err());
    }

    #[test]
    fn validate_rejects_invalid_listen_address() {
        let config = GatewayConfig {
            listen_addr: "localhost".to_string(),
            ..GatewayConfig::default()
        };
        assert!(DefinitionValidator::validate_gateway(&config).is_err());
    }
}
