//! Registry and resolver behavior over the in-memory KV store

use std::sync::Arc;
use std::time::Duration;

use nexus_registry::balancer::RoundRobin;
use nexus_registry::kv::MemoryStore;
use nexus_registry::{
    Protocol, Registry, RegistryConfig, Resolver, ResolverOptions, ServiceInstance,
};

fn test_registry(store: &MemoryStore) -> Arc<Registry> {
    let config = RegistryConfig {
        lease_ttl_secs: 5,
        ..Default::default()
    };
    Arc::new(Registry::new(Arc::new(store.clone()), config).unwrap())
}

fn instance(name: &str, address: &str, protocol: Protocol, weight: u32) -> ServiceInstance {
    let mut inst = ServiceInstance::new(name, address, protocol);
    inst.weight = weight;
    inst
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn discover_by_name_and_protocol() {
    let store = MemoryStore::new();
    let registry = test_registry(&store);

    registry
        .register(instance("user-service", "10.0.0.1:8080", Protocol::Http, 10))
        .await
        .unwrap();
    registry
        .register(instance("user-service", "10.0.0.1:9090", Protocol::Grpc, 10))
        .await
        .unwrap();

    let all = registry.discover("user-service").await.unwrap();
    assert_eq!(all.len(), 2);

    let grpc = registry
        .discover_by_protocol("user-service", Protocol::Grpc)
        .await
        .unwrap();
    assert_eq!(grpc.len(), 1);
    assert_eq!(grpc[0].address, "10.0.0.1:9090");
}

#[tokio::test]
async fn reregistration_keeps_one_live_key() {
    let store = MemoryStore::new();
    let registry = test_registry(&store);

    let inst = instance("user-service", "10.0.0.1:8080", Protocol::Http, 1);
    registry.register(inst.clone()).await.unwrap();
    registry.register(inst.clone()).await.unwrap();

    let all = registry.discover("user-service").await.unwrap();
    assert_eq!(all.len(), 1);

    // the surviving key still goes away on deregister
    registry.deregister(&inst).await.unwrap();
    let all = registry.discover("user-service").await.unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
async fn malformed_entries_are_skipped() {
    let store = MemoryStore::new();
    let registry = test_registry(&store);

    registry
        .register(instance("user-service", "10.0.0.1:8080", Protocol::Http, 1))
        .await
        .unwrap();

    use nexus_registry::kv::KvStore;
    store
        .put("/nexus/services/user-service/broken", "not json", None)
        .await
        .unwrap();

    let all = registry.discover("user-service").await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn resolver_converges_with_discover() {
    let store = MemoryStore::new();
    let registry = test_registry(&store);

    registry
        .register(instance("user-service", "10.0.0.1:8080", Protocol::Http, 1))
        .await
        .unwrap();

    let resolver = Resolver::start(
        registry.clone(),
        "user-service",
        Box::new(RoundRobin::new()),
        ResolverOptions::default(),
    )
    .await
    .unwrap();

    registry
        .register(instance("user-service", "10.0.0.2:8080", Protocol::Http, 1))
        .await
        .unwrap();
    registry
        .register(instance("user-service", "10.0.0.3:8080", Protocol::Http, 1))
        .await
        .unwrap();
    registry
        .deregister(&instance("user-service", "10.0.0.1:8080", Protocol::Http, 1))
        .await
        .unwrap();
    settle().await;

    let mut cached: Vec<String> = resolver
        .instances()
        .await
        .into_iter()
        .map(|i| i.id)
        .collect();
    cached.sort();

    let mut discovered: Vec<String> = registry
        .discover("user-service")
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    discovered.sort();

    assert_eq!(cached, discovered);
    assert_eq!(cached.len(), 2);

    resolver.close();
}

#[tokio::test]
async fn resolver_refreshes_after_stream_loss() {
    let store = MemoryStore::new();
    let registry = test_registry(&store);

    registry
        .register(instance("user-service", "10.0.0.1:8080", Protocol::Http, 1))
        .await
        .unwrap();

    let resolver = Resolver::start(
        registry.clone(),
        "user-service",
        Box::new(RoundRobin::new()),
        ResolverOptions::default(),
    )
    .await
    .unwrap();

    // server-side disconnect: the watch channel closes and the resolver
    // must reconcile with a full discovery
    store.disconnect_watchers().await;
    registry
        .register(instance("user-service", "10.0.0.2:8080", Protocol::Http, 1))
        .await
        .unwrap();
    settle().await;

    let mut cached: Vec<String> = resolver
        .instances()
        .await
        .into_iter()
        .map(|i| i.id)
        .collect();
    cached.sort();
    assert_eq!(cached, vec!["10.0.0.1:8080", "10.0.0.2:8080"]);

    resolver.close();
}

#[tokio::test]
async fn resolver_honors_protocol_filter() {
    let store = MemoryStore::new();
    let registry = test_registry(&store);

    registry
        .register(instance("user-service", "10.0.0.1:8080", Protocol::Http, 1))
        .await
        .unwrap();
    registry
        .register(instance("user-service", "10.0.0.1:9090", Protocol::Grpc, 1))
        .await
        .unwrap();

    let resolver = Resolver::start(
        registry.clone(),
        "user-service",
        Box::new(RoundRobin::new()),
        ResolverOptions {
            protocol: Some(Protocol::Grpc),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let cached = resolver.instances().await;
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].protocol, Protocol::Grpc);

    // http updates are filtered out of the watch stream as well
    registry
        .register(instance("user-service", "10.0.0.2:8080", Protocol::Http, 1))
        .await
        .unwrap();
    settle().await;
    assert_eq!(resolver.instances().await.len(), 1);

    resolver.close();
}

#[tokio::test]
async fn close_revokes_all_leases() {
    let store = MemoryStore::new();
    let registry = test_registry(&store);

    registry
        .register(instance("user-service", "10.0.0.1:8080", Protocol::Http, 1))
        .await
        .unwrap();
    registry
        .register(instance("order-service", "10.0.0.2:8080", Protocol::Http, 1))
        .await
        .unwrap();

    registry.close().await;

    assert!(registry.discover("user-service").await.unwrap().is_empty());
    assert!(registry.discover("order-service").await.unwrap().is_empty());
}
