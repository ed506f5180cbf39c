use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{
    config::models::{ApiType, ConnectorMode, EndpointDefinition, EndpointGroupDefinition},
    core::{
        connector::ConnectorRegistry,
        load_balancer::{LoadBalancerFactory, LoadBalancingStrategy},
        template::TemplateVariableProvider,
    },
    metrics,
    ports::connector::{ConnectorError, EndpointConfiguration, EndpointConnector},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Up,
    Down,
}

/// An endpoint with its connector instance, as seen by one snapshot.
#[derive(Clone)]
pub struct ManagedEndpoint {
    definition: EndpointDefinition,
    group: String,
    connector: Arc<dyn EndpointConnector>,
    status: EndpointStatus,
}

impl ManagedEndpoint {
    pub fn new(
        definition: EndpointDefinition,
        group: impl Into<String>,
        connector: Arc<dyn EndpointConnector>,
    ) -> Self {
        Self {
            definition,
            group: group.into(),
            connector,
            status: EndpointStatus::Up,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// `group:name`
    pub fn id(&self) -> String {
        format!("{}:{}", self.group, self.definition.name)
    }

    pub fn definition(&self) -> &EndpointDefinition {
        &self.definition
    }

    pub fn connector(&self) -> &Arc<dyn EndpointConnector> {
        &self.connector
    }

    pub fn status(&self) -> EndpointStatus {
        self.status
    }

    pub fn is_up(&self) -> bool {
        self.status == EndpointStatus::Up
    }
}

impl fmt::Debug for ManagedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedEndpoint")
            .field("id", &self.id())
            .field("connector", &self.connector.id())
            .field("status", &self.status)
            .finish()
    }
}

/// Constraints an endpoint must satisfy to be selected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointCriteria {
    /// Endpoint or group name
    pub name: Option<String>,
    pub api_type: Option<ApiType>,
    pub modes: HashSet<ConnectorMode>,
}

impl EndpointCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_api_type(mut self, api_type: ApiType) -> Self {
        self.api_type = Some(api_type);
        self
    }

    pub fn with_modes(mut self, modes: impl IntoIterator<Item = ConnectorMode>) -> Self {
        self.modes.extend(modes);
        self
    }

    /// Connector compatibility: same API type and every required mode supported
    pub fn accepts(&self, endpoint: &ManagedEndpoint) -> bool {
        let connector = endpoint.connector();
        self.api_type
            .is_none_or(|api_type| connector.supported_api() == api_type)
            && self.modes.is_subset(connector.supported_modes())
    }
}

struct ManagedGroup {
    definition: EndpointGroupDefinition,
    strategy: Arc<dyn LoadBalancingStrategy>,
    endpoints: Vec<Arc<ManagedEndpoint>>,
}

impl ManagedGroup {
    fn name(&self) -> &str {
        &self.definition.name
    }

    /// Primary endpoints first; backups only when no primary is available
    fn select(&self, criteria: &EndpointCriteria) -> Option<Arc<ManagedEndpoint>> {
        let eligible = |backup: bool| -> Vec<&Arc<ManagedEndpoint>> {
            self.endpoints
                .iter()
                .filter(|e| e.is_up() && e.definition.backup == backup && criteria.accepts(e))
                .collect()
        };

        let mut candidates = eligible(false);
        if candidates.is_empty() {
            candidates = eligible(true);
        }

        let weights: Vec<u32> = candidates.iter().map(|e| e.definition.weight).collect();
        self.strategy
            .select(&weights)
            .and_then(|index| candidates.get(index).map(|e| (*e).clone()))
    }

    fn with_endpoints(&self, endpoints: Vec<Arc<ManagedEndpoint>>) -> Arc<ManagedGroup> {
        Arc::new(ManagedGroup {
            definition: self.definition.clone(),
            strategy: self.strategy.clone(),
            endpoints,
        })
    }
}

#[derive(Default)]
struct EndpointSnapshot {
    groups: Vec<Arc<ManagedGroup>>,
}

/// Per-API registry of endpoint groups.
///
/// Readers load an immutable snapshot; health and group events build a new snapshot and
/// swap it atomically, so in-flight selections never observe a partial update.
pub struct EndpointManager {
    api_id: String,
    registry: ConnectorRegistry,
    snapshot: ArcSwap<EndpointSnapshot>,
    write_lock: Mutex<()>,
}

impl EndpointManager {
    /// Build the manager, creating one connector per endpoint. Endpoints whose connector
    /// cannot be created are logged and left out.
    pub fn new(api_id: &str, groups: &[EndpointGroupDefinition], registry: &ConnectorRegistry) -> Self {
        let groups = groups
            .iter()
            .map(|group| {
                let endpoints = group
                    .endpoints
                    .iter()
                    .filter_map(|endpoint| match Self::create_endpoint(registry, group, endpoint) {
                        Ok(managed) => Some(Arc::new(managed)),
                        Err(e) => {
                            warn!(
                                api.id = api_id,
                                endpoint = %endpoint.name,
                                error = %e,
                                "Endpoint connector could not be created, endpoint ignored"
                            );
                            None
                        }
                    })
                    .collect();
                Arc::new(ManagedGroup {
                    definition: group.clone(),
                    strategy: LoadBalancerFactory::create_strategy(&group.load_balancer),
                    endpoints,
                })
            })
            .collect();

        Self {
            api_id: api_id.to_string(),
            registry: registry.clone(),
            snapshot: ArcSwap::from_pointee(EndpointSnapshot { groups }),
            write_lock: Mutex::new(()),
        }
    }

    fn create_endpoint(
        registry: &ConnectorRegistry,
        group: &EndpointGroupDefinition,
        endpoint: &EndpointDefinition,
    ) -> Result<ManagedEndpoint, ConnectorError> {
        let kind = endpoint.kind.as_deref().unwrap_or(&group.kind);
        let shared_configuration = if endpoint.inherit_configuration {
            &group.shared_configuration
        } else {
            &endpoint.shared_configuration_override
        };
        let connector = registry.create_endpoint(
            kind,
            EndpointConfiguration {
                endpoint_name: &endpoint.name,
                configuration: &endpoint.configuration,
                shared_configuration,
            },
        )?;
        Ok(ManagedEndpoint::new(endpoint.clone(), group.name.clone(), connector))
    }

    pub fn api_id(&self) -> &str {
        &self.api_id
    }

    /// Select an endpoint satisfying `criteria`.
    ///
    /// A named criteria first designates an endpoint (returned only if it is up and
    /// compatible), then a group (load balanced within). Without a name the first group
    /// with a compatible endpoint is used.
    pub fn next(&self, criteria: &EndpointCriteria) -> Option<Arc<ManagedEndpoint>> {
        let snapshot = self.snapshot.load();

        match &criteria.name {
            Some(name) => {
                let named = snapshot
                    .groups
                    .iter()
                    .flat_map(|g| g.endpoints.iter())
                    .find(|e| e.name() == name.as_str());
                if let Some(endpoint) = named {
                    return (endpoint.is_up() && criteria.accepts(endpoint)).then(|| endpoint.clone());
                }
                snapshot
                    .groups
                    .iter()
                    .find(|g| g.name() == name.as_str())
                    .and_then(|g| g.select(criteria))
            }
            None => snapshot.groups.iter().find_map(|g| g.select(criteria)),
        }
    }

    /// Every managed endpoint, whatever its status
    pub fn endpoints(&self) -> Vec<Arc<ManagedEndpoint>> {
        self.snapshot
            .load()
            .groups
            .iter()
            .flat_map(|g| g.endpoints.iter().cloned())
            .collect()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.snapshot
            .load()
            .groups
            .iter()
            .map(|g| g.name().to_string())
            .collect()
    }

    /// Apply a health event. Returns `false` when the endpoint is unknown or unchanged.
    pub fn set_status(&self, endpoint_name: &str, status: EndpointStatus) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot.load_full();

        let mut changed = None;
        let groups = current
            .groups
            .iter()
            .map(|group| {
                if !group.endpoints.iter().any(|e| e.name() == endpoint_name && e.status != status) {
                    return group.clone();
                }
                let endpoints = group
                    .endpoints
                    .iter()
                    .map(|e| {
                        if e.name() == endpoint_name {
                            let mut updated = (**e).clone();
                            updated.status = status;
                            changed = Some(updated.id());
                            Arc::new(updated)
                        } else {
                            e.clone()
                        }
                    })
                    .collect();
                group.with_endpoints(endpoints)
            })
            .collect();

        let Some(endpoint_id) = changed else {
            return false;
        };
        self.snapshot.store(Arc::new(EndpointSnapshot { groups }));

        info!(api.id = %self.api_id, endpoint = %endpoint_id, ?status, "Endpoint status changed");
        metrics::set_endpoint_health_status(
            &format!("{}/{}", self.api_id, endpoint_id),
            status == EndpointStatus::Up,
        );
        true
    }

    /// Add an endpoint to an existing group
    pub fn add_endpoint(&self, group_name: &str, endpoint: EndpointDefinition) -> Result<(), ConnectorError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot.load_full();

        let group = current
            .groups
            .iter()
            .find(|g| g.name() == group_name)
            .ok_or_else(|| {
                ConnectorError::invalid_configuration(group_name, "unknown endpoint group")
            })?;
        let managed = Arc::new(Self::create_endpoint(&self.registry, &group.definition, &endpoint)?);

        let groups = current
            .groups
            .iter()
            .map(|g| {
                if g.name() != group_name {
                    return g.clone();
                }
                let mut endpoints: Vec<_> = g
                    .endpoints
                    .iter()
                    .filter(|e| e.name() != endpoint.name)
                    .cloned()
                    .collect();
                endpoints.push(managed.clone());
                g.with_endpoints(endpoints)
            })
            .collect();
        self.snapshot.store(Arc::new(EndpointSnapshot { groups }));

        info!(api.id = %self.api_id, endpoint = %managed.id(), "Endpoint added");
        Ok(())
    }

    pub fn remove_endpoint(&self, endpoint_name: &str) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot.load_full();

        let mut removed = false;
        let groups = current
            .groups
            .iter()
            .map(|g| {
                if !g.endpoints.iter().any(|e| e.name() == endpoint_name) {
                    return g.clone();
                }
                removed = true;
                g.with_endpoints(
                    g.endpoints
                        .iter()
                        .filter(|e| e.name() != endpoint_name)
                        .cloned()
                        .collect(),
                )
            })
            .collect();

        if removed {
            self.snapshot.store(Arc::new(EndpointSnapshot { groups }));
            info!(api.id = %self.api_id, endpoint = endpoint_name, "Endpoint removed");
        }
        removed
    }
}

/// Exposes `endpoints['<name>']` to templates as `<name>:`, so that
/// `{#endpoints['billing']}/invoices` renders to a `name:path` target.
pub struct EndpointVariableProvider {
    names: Vec<String>,
}

impl EndpointVariableProvider {
    pub fn new(manager: &EndpointManager) -> Self {
        let mut names = manager.group_names();
        names.extend(manager.endpoints().iter().map(|e| e.name().to_string()));
        Self { names }
    }
}

impl TemplateVariableProvider for EndpointVariableProvider {
    fn provide(&self, variables: &mut Map<String, Value>) {
        let endpoints: Map<String, Value> = self
            .names
            .iter()
            .map(|name| (name.clone(), Value::String(format!("{name}:"))))
            .collect();
        variables.insert("endpoints".to_string(), Value::Object(endpoints));
    }
}
