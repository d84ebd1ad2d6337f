//! Service resolver: local instance cache + background watch + picker
//!
//! A resolver keeps a live copy of one service's instance set, applying
//! watch events incrementally and falling back to a full refresh when the
//! watch stream is lost.

use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::balancer::Picker;
use crate::config::DEFAULT_PREFIX;
use crate::error::{RegistryError, RegistryResult};
use crate::registry::Registry;
use crate::types::{EventType, Protocol, ServiceInstance, WatchEvent};

/// Options for constructing a [`Resolver`]
#[derive(Clone)]
pub struct ResolverOptions {
    /// Only track instances speaking this protocol
    pub protocol: Option<Protocol>,

    /// Key prefix used to match delete events against cached instances
    pub prefix: String,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            protocol: None,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

/// Live view of a service's instance set with pluggable selection
pub struct Resolver {
    service_name: String,
    protocol: Option<Protocol>,
    picker: Box<dyn Picker>,
    instances: Arc<RwLock<Vec<ServiceInstance>>>,
    cancel: CancellationToken,
}

impl Resolver {
    /// Perform the initial discovery, open a watch and start the consumer.
    ///
    /// Fails if the initial discovery or the watch cannot be established.
    pub async fn start(
        registry: Arc<Registry>,
        service_name: impl Into<String>,
        picker: Box<dyn Picker>,
        options: ResolverOptions,
    ) -> RegistryResult<Self> {
        let service_name = service_name.into();

        let initial = fetch_instances(&registry, &service_name, options.protocol).await?;
        let instances = Arc::new(RwLock::new(initial));

        let cancel = CancellationToken::new();
        let events = registry.watch(&service_name, cancel.clone()).await?;

        {
            let registry = registry.clone();
            let instances = instances.clone();
            let service_name = service_name.clone();
            let options = options.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                watch_loop(registry, instances, service_name, options, events, cancel).await;
            });
        }

        info!(
            "resolver started: {} ({} instances)",
            service_name,
            instances.read().await.len()
        );

        Ok(Self {
            service_name,
            protocol: options.protocol,
            picker,
            instances,
            cancel,
        })
    }

    /// Select one instance from the current set
    pub async fn resolve(&self) -> RegistryResult<ServiceInstance> {
        let snapshot = {
            let instances = self.instances.read().await;
            instances.clone()
        };
        if snapshot.is_empty() {
            return Err(RegistryError::NoInstance(self.service_name.clone()));
        }
        self.picker.pick(&snapshot)
    }

    /// Defensive copy of the cached instance set
    pub async fn instances(&self) -> Vec<ServiceInstance> {
        self.instances.read().await.clone()
    }

    /// Name of the service this resolver tracks
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Protocol filter, when one was configured
    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    /// Stop the background watch
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn fetch_instances(
    registry: &Registry,
    service_name: &str,
    protocol: Option<Protocol>,
) -> RegistryResult<Vec<ServiceInstance>> {
    match protocol {
        Some(p) => registry.discover_by_protocol(service_name, p).await,
        None => registry.discover(service_name).await,
    }
}

/// Consume watch events until the stream closes or the resolver is
/// closed. Stream loss triggers a single reconciling refresh before the
/// consumer exits; cancellation does not.
async fn watch_loop(
    registry: Arc<Registry>,
    instances: Arc<RwLock<Vec<ServiceInstance>>>,
    service_name: String,
    options: ResolverOptions,
    mut events: mpsc::Receiver<WatchEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => {
                    let mut guard = instances.write().await;
                    apply_event(&mut guard, event, options.protocol, &options.prefix);
                }
                None => break,
            },
        }
    }

    match fetch_instances(&registry, &service_name, options.protocol).await {
        Ok(fresh) => {
            *instances.write().await = fresh;
        }
        Err(e) => {
            warn!("refresh failed: {}: {}", service_name, e);
        }
    }
}

fn apply_event(
    instances: &mut Vec<ServiceInstance>,
    event: WatchEvent,
    protocol: Option<Protocol>,
    prefix: &str,
) {
    match event.event_type {
        EventType::Put => {
            let incoming = event.instance;
            if let Some(p) = protocol {
                if incoming.protocol != p {
                    return;
                }
            }
            match instances.iter_mut().find(|inst| inst.id == incoming.id) {
                Some(existing) => *existing = incoming,
                None => instances.push(incoming),
            }
        }
        EventType::Delete => {
            // Delete events identify the instance by its key, so match on
            // either the raw id or the instance's full key.
            let deleted = &event.instance.id;
            if let Some(pos) = instances
                .iter()
                .position(|inst| inst.id == *deleted || inst.build_key(prefix) == *deleted)
            {
                instances.remove(pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, protocol: Protocol) -> ServiceInstance {
        let mut inst = ServiceInstance::new("svc", format!("{}:80", id), protocol);
        inst.id = id.to_string();
        inst
    }

    #[test]
    fn put_replaces_or_appends() {
        let mut set = vec![instance("a", Protocol::Http)];

        let mut updated = instance("a", Protocol::Http);
        updated.weight = 5;
        apply_event(
            &mut set,
            WatchEvent {
                event_type: EventType::Put,
                instance: updated,
            },
            None,
            DEFAULT_PREFIX,
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].weight, 5);

        apply_event(
            &mut set,
            WatchEvent {
                event_type: EventType::Put,
                instance: instance("b", Protocol::Http),
            },
            None,
            DEFAULT_PREFIX,
        );
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn put_honors_protocol_filter() {
        let mut set = vec![];
        apply_event(
            &mut set,
            WatchEvent {
                event_type: EventType::Put,
                instance: instance("a", Protocol::Grpc),
            },
            Some(Protocol::Http),
            DEFAULT_PREFIX,
        );
        assert!(set.is_empty());
    }

    #[test]
    fn delete_matches_by_id_or_key() {
        let mut set = vec![instance("a", Protocol::Http), instance("b", Protocol::Http)];

        // plain id match
        let mut ev = instance("ignored", Protocol::Http);
        ev.id = "a".to_string();
        apply_event(
            &mut set,
            WatchEvent {
                event_type: EventType::Delete,
                instance: ev,
            },
            None,
            DEFAULT_PREFIX,
        );
        assert_eq!(set.len(), 1);

        // full key match, as produced by the KV layer
        let mut ev = instance("ignored", Protocol::Http);
        ev.id = format!("{}/svc/b", DEFAULT_PREFIX);
        apply_event(
            &mut set,
            WatchEvent {
                event_type: EventType::Delete,
                instance: ev,
            },
            None,
            DEFAULT_PREFIX,
        );
        assert!(set.is_empty());
    }
}
