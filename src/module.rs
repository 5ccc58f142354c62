//! module.rs
//!
//! Typed lookup table from a service contract to the single instance bound
//! for it. Filled during startup through [`ModuleRegistryBuilder`], checked
//! against the contracts the running configuration declares, then frozen.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::StartupError;
use crate::query::{AggregationQueryDao, MetricsQueryDao};

/// Identity of a service contract, usually a `dyn Trait`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    id: TypeId,
    name: &'static str,
}

impl ServiceKey {
    pub fn of<S: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<S>(),
            name: type_name::<S>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Contracts the storage module must provide before queries are served.
pub fn storage_services() -> Vec<ServiceKey> {
    vec![
        ServiceKey::of::<dyn AggregationQueryDao>(),
        ServiceKey::of::<dyn MetricsQueryDao>(),
    ]
}

struct Binding {
    name: &'static str,
    // Always an `Arc<S>` for the `S` the key was derived from.
    instance: Box<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub struct ModuleRegistryBuilder {
    bindings: HashMap<TypeId, Binding>,
}

impl ModuleRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `service` as the implementation of `S`. A second registration
    /// for the same contract replaces the first.
    pub fn register<S>(&mut self, service: Arc<S>) -> &mut Self
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let key = ServiceKey::of::<S>();
        let previous = self.bindings.insert(
            key.id,
            Binding {
                name: key.name,
                instance: Box::new(service),
            },
        );
        if previous.is_some() {
            warn!(service = key.name, "Service registered twice, last registration wins");
        }
        self
    }

    /// Freeze the table. Every key in `required` must be bound.
    pub fn build(self, required: &[ServiceKey]) -> Result<ModuleRegistry, StartupError> {
        if let Some(missing) = required.iter().find(|key| !self.bindings.contains_key(&key.id)) {
            return Err(StartupError::UnresolvedService(missing.name));
        }
        for binding in self.bindings.values() {
            info!(service = binding.name, "Service bound");
        }
        Ok(ModuleRegistry {
            bindings: self.bindings,
        })
    }
}

/// Read-only after construction; share it behind an `Arc`.
pub struct ModuleRegistry {
    bindings: HashMap<TypeId, Binding>,
}

impl ModuleRegistry {
    pub fn builder() -> ModuleRegistryBuilder {
        ModuleRegistryBuilder::new()
    }

    pub fn service<S>(&self) -> Result<Arc<S>, StartupError>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        self.bindings
            .get(&TypeId::of::<S>())
            .and_then(|binding| binding.instance.downcast_ref::<Arc<S>>())
            .cloned()
            .ok_or(StartupError::UnresolvedService(type_name::<S>()))
    }

    pub fn contains(&self, key: &ServiceKey) -> bool {
        self.bindings.contains_key(&key.id)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// The query contracts, resolved once for the query services that use them.
#[derive(Clone)]
pub struct CoreServices {
    pub aggregation: Arc<dyn AggregationQueryDao>,
    pub metrics: Arc<dyn MetricsQueryDao>,
}

impl CoreServices {
    pub fn resolve(registry: &ModuleRegistry) -> Result<Self, StartupError> {
        Ok(Self {
            aggregation: registry.service::<dyn AggregationQueryDao>()?,
            metrics: registry.service::<dyn MetricsQueryDao>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;
    struct French;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    impl Greeter for French {
        fn greet(&self) -> String {
            "bonjour".into()
        }
    }

    #[test]
    fn lookup_by_contract_type() {
        let mut builder = ModuleRegistry::builder();
        builder.register::<dyn Greeter>(Arc::new(English));
        let registry = builder.build(&[ServiceKey::of::<dyn Greeter>()]).unwrap();

        assert_eq!(registry.service::<dyn Greeter>().unwrap().greet(), "hello");
        assert!(registry.contains(&ServiceKey::of::<dyn Greeter>()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn last_registration_wins() {
        let mut builder = ModuleRegistry::builder();
        builder
            .register::<dyn Greeter>(Arc::new(English))
            .register::<dyn Greeter>(Arc::new(French));
        let registry = builder.build(&[]).unwrap();
        assert_eq!(registry.service::<dyn Greeter>().unwrap().greet(), "bonjour");
    }

    #[test]
    fn missing_required_service_fails_build() {
        let err = ModuleRegistry::builder()
            .build(&storage_services())
            .err()
            .unwrap();
        assert!(matches!(err, StartupError::UnresolvedService(name) if name.contains("AggregationQueryDao")));
    }

    #[test]
    fn unbound_lookup_is_an_error() {
        let registry = ModuleRegistry::builder().build(&[]).unwrap();
        assert!(registry.is_empty());
        assert!(registry.service::<dyn Greeter>().is_err());
    }
}
