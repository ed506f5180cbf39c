use std::{collections::HashMap, sync::Arc};

use tracing::debug;

use crate::{
    config::models::StepDefinition,
    ports::policy::{Policy, PolicyError, PolicyFactory},
};

/// Policy factories registered by policy id.
#[derive(Default, Clone)]
pub struct PolicyRegistry {
    factories: HashMap<String, Arc<dyn PolicyFactory>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn PolicyFactory>) {
        self.factories
            .insert(factory.policy_id().to_string(), factory);
    }

    pub fn contains(&self, policy_id: &str) -> bool {
        self.factories.contains_key(policy_id)
    }

    pub fn create(&self, step: &StepDefinition) -> Result<Arc<dyn Policy>, PolicyError> {
        self.factories
            .get(&step.policy)
            .ok_or_else(|| PolicyError::PluginNotFound(step.policy.clone()))?
            .create(&step.configuration)
    }
}

/// Per-API policy instances, created on first use and cached by step key.
pub struct PolicyManager {
    registry: Arc<PolicyRegistry>,
    policies: scc::HashMap<String, Arc<dyn Policy>>,
}

impl PolicyManager {
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self {
            registry,
            policies: scc::HashMap::new(),
        }
    }

    /// Policy for the step identified by `key`, created from `step` on first use.
    pub async fn get_or_create(
        &self,
        key: &str,
        step: &StepDefinition,
    ) -> Result<Arc<dyn Policy>, PolicyError> {
        if let Some(policy) = self.policies.read_async(key, |_, policy| policy.clone()).await {
            return Ok(policy);
        }

        let policy = self.registry.create(step)?;
        debug!(policy = %step.policy, key, "Policy instance created");
        // A concurrent request may have created the same step; keep the first instance
        if let Err((_, _)) = self.policies.insert_async(key.to_string(), policy.clone()).await {
            if let Some(existing) = self.policies.read_async(key, |_, policy| policy.clone()).await {
                return Ok(existing);
            }
        }
        Ok(policy)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use super::*;

    struct Noop;

    impl Policy for Noop {
        fn id(&self) -> &str {
            "noop"
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
    }

    impl PolicyFactory for CountingFactory {
        fn policy_id(&self) -> &str {
            "noop"
        }

        fn create(&self, _configuration: &Value) -> Result<Arc<dyn Policy>, PolicyError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Noop))
        }
    }

    #[tokio::test]
    async fn test_policies_are_cached_per_step() {
        let factory = Arc::new(CountingFactory::default());
        let mut registry = PolicyRegistry::new();
        registry.register(factory.clone());
        let manager = PolicyManager::new(Arc::new(registry));

        let step = StepDefinition::new("noop", json!({}));
        manager.get_or_create("api/0/request/0", &step).await.unwrap();
        manager.get_or_create("api/0/request/0", &step).await.unwrap();
        manager.get_or_create("api/0/request/1", &step).await.unwrap();

        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_policy() {
        let manager = PolicyManager::new(Arc::new(PolicyRegistry::new()));
        let step = StepDefinition::new("missing", Value::Null);
        let err = manager.get_or_create("k", &step).await.err().unwrap();
        assert!(matches!(err, PolicyError::PluginNotFound(id) if id == "missing"));
    }
}
