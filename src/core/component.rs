use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    sync::Arc,
};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComponentError {
    #[error("No component of type {0} is registered")]
    NotFound(&'static str),
}

/// Type-keyed registry of services scoped to a deployment (endpoint manager, API
/// definition, shared clients). Policies reach them through
/// [`ExecutionContext::component`](crate::core::context::ExecutionContext::component).
#[derive(Default, Clone)]
pub struct ComponentRegistry {
    components: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component, replacing any previous one of the same type
    pub fn register<T: Any + Send + Sync>(&mut self, component: Arc<T>) {
        self.components.insert(TypeId::of::<T>(), component);
    }

    pub fn with<T: Any + Send + Sync>(mut self, component: Arc<T>) -> Self {
        self.register(component);
        self
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ComponentError> {
        self.components
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|component| component.downcast::<T>().ok())
            .ok_or(ComponentError::NotFound(type_name::<T>()))
    }

    /// Copy of this registry with the entries of `other` layered on top
    pub fn merged(&self, other: &ComponentRegistry) -> ComponentRegistry {
        let mut merged = self.clone();
        merged
            .components
            .extend(other.components.iter().map(|(k, v)| (*k, v.clone())));
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock(u64);

    #[test]
    fn test_register_and_get() {
        let registry = ComponentRegistry::new().with(Arc::new(Clock(42)));
        assert_eq!(registry.get::<Clock>().unwrap().0, 42);
    }

    #[test]
    fn test_missing_component() {
        let registry = ComponentRegistry::new();
        let err = registry.get::<Clock>().err().unwrap();
        assert!(matches!(err, ComponentError::NotFound(name) if name.ends_with("Clock")));
    }

    #[test]
    fn test_merged_prefers_other() {
        let base = ComponentRegistry::new().with(Arc::new(Clock(1)));
        let api = ComponentRegistry::new().with(Arc::new(Clock(2)));
        assert_eq!(base.merged(&api).get::<Clock>().unwrap().0, 2);
        assert_eq!(base.get::<Clock>().unwrap().0, 1);
    }
}
