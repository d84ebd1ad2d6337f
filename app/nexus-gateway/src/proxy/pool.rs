//! Per-service resolver pool with lazy creation and strategy hot-swap

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

use nexus_registry::balancer::{Picker, Random, RoundRobin, WeightedRoundRobin};
use nexus_registry::{Registry, RegistryResult, Resolver, ResolverOptions};

/// Factory producing one independent picker per resolver
pub type PickerFactory = Arc<dyn Fn() -> Box<dyn Picker> + Send + Sync>;

/// Build a picker factory for a strategy name; unknown names fall back to
/// round-robin.
pub fn picker_factory(strategy: &str) -> PickerFactory {
    match strategy {
        "random" => Arc::new(|| Box::new(Random::new())),
        "weighted_round_robin" => Arc::new(|| Box::new(WeightedRoundRobin::new())),
        _ => Arc::new(|| Box::new(RoundRobin::new())),
    }
}

/// Caches one [`Resolver`] per service name.
///
/// A strategy update swaps the picker factory and drops every resolver;
/// the next request per service rebuilds with the new strategy.
pub struct ResolverPool {
    registry: Arc<Registry>,
    resolvers: RwLock<HashMap<String, Arc<Resolver>>>,
    factory: RwLock<PickerFactory>,
}

impl ResolverPool {
    pub fn new(registry: Arc<Registry>, factory: PickerFactory) -> Self {
        Self {
            registry,
            resolvers: RwLock::new(HashMap::new()),
            factory: RwLock::new(factory),
        }
    }

    /// Return the resolver for a service, creating it on first use
    pub async fn get_or_create(&self, service_name: &str) -> RegistryResult<Arc<Resolver>> {
        if let Some(resolver) = self
            .resolvers
            .read()
            .expect("resolver map poisoned")
            .get(service_name)
        {
            return Ok(resolver.clone());
        }

        let picker = {
            let factory = self.factory.read().expect("picker factory poisoned");
            factory()
        };
        let options = ResolverOptions {
            prefix: self.registry.prefix().to_string(),
            ..Default::default()
        };
        let resolver = Arc::new(
            Resolver::start(self.registry.clone(), service_name, picker, options).await?,
        );

        let mut resolvers = self.resolvers.write().expect("resolver map poisoned");
        // another caller may have won the race while we were discovering
        if let Some(existing) = resolvers.get(service_name) {
            resolver.close();
            return Ok(existing.clone());
        }
        resolvers.insert(service_name.to_string(), resolver.clone());
        Ok(resolver)
    }

    /// Swap the load balancing strategy and drop all resolvers so new
    /// requests rebuild with fresh pickers.
    pub fn update_strategy(&self, strategy: &str) {
        *self.factory.write().expect("picker factory poisoned") = picker_factory(strategy);

        let mut resolvers = self.resolvers.write().expect("resolver map poisoned");
        for resolver in resolvers.values() {
            resolver.close();
        }
        resolvers.clear();

        info!("load balancer strategy updated to: {}", strategy);
    }

    /// Close every resolver
    pub fn close(&self) {
        let mut resolvers = self.resolvers.write().expect("resolver map poisoned");
        for resolver in resolvers.values() {
            resolver.close();
        }
        resolvers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_registry::kv::MemoryStore;
    use nexus_registry::{Protocol, RegistryConfig, ServiceInstance};

    async fn pool_with_service() -> ResolverPool {
        let store = MemoryStore::new();
        let registry = Arc::new(
            Registry::new(Arc::new(store), RegistryConfig::default()).unwrap(),
        );
        registry
            .register(ServiceInstance::new(
                "user-service",
                "10.0.0.1:8080",
                Protocol::Http,
            ))
            .await
            .unwrap();
        ResolverPool::new(registry, picker_factory("round_robin"))
    }

    #[tokio::test]
    async fn resolvers_are_cached_per_service() {
        let pool = pool_with_service().await;

        let first = pool.get_or_create("user-service").await.unwrap();
        let second = pool.get_or_create("user-service").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn strategy_update_drops_resolvers() {
        let pool = pool_with_service().await;

        let before = pool.get_or_create("user-service").await.unwrap();
        pool.update_strategy("weighted_round_robin");
        let after = pool.get_or_create("user-service").await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }
}
