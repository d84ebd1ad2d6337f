//! Service registry core
//!
//! Registers local instances under lease-bound keys and exposes discovery
//! and prefix watches over the [`KvStore`] seam.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RegistryConfig;
use crate::error::RegistryResult;
use crate::kv::{KvEventKind, KvStore, LeaseId, WATCH_BUFFER};
use crate::types::{service_prefix, EventType, Protocol, ServiceInstance, WatchEvent};

/// Registry over a KV store with lease-bound registration
pub struct Registry {
    kv: Arc<dyn KvStore>,
    config: RegistryConfig,
    registered: RwLock<HashMap<String, LeaseId>>,
}

impl Registry {
    /// Create a registry over the given KV store
    pub fn new(kv: Arc<dyn KvStore>, config: RegistryConfig) -> RegistryResult<Self> {
        config.validate()?;
        Ok(Self {
            kv,
            config,
            registered: RwLock::new(HashMap::new()),
        })
    }

    /// Key prefix this registry operates under
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Register a service instance with automatic lease renewal.
    ///
    /// Re-registering the same `(name, id)` replaces the value under a new
    /// lease; the old lease is released no later than its TTL.
    pub async fn register(&self, instance: ServiceInstance) -> RegistryResult<()> {
        let mut instance = instance;
        instance.validate()?;

        let lease = self.kv.grant(self.config.lease_ttl_secs).await?;
        let value = instance.marshal()?;
        let key = instance.build_key(&self.config.prefix);
        self.kv.put(&key, &value, Some(lease)).await?;

        // Drain renewal acks until the channel closes. Lease loss is only
        // observable here, so log it loudly.
        let mut acks = self.kv.keep_alive(lease).await?;
        let ack_key = key.clone();
        tokio::spawn(async move {
            while acks.recv().await.is_some() {}
            warn!("keepalive channel closed: {}", ack_key);
        });

        let previous = self.registered.write().await.insert(key.clone(), lease);
        if let Some(old) = previous.filter(|old| *old != lease) {
            // the key now lives under the new lease; release the stale one
            if let Err(e) = self.kv.revoke(old).await {
                warn!("revoke stale lease for {} failed: {}", key, e);
            }
        }

        info!(
            "registered: {} -> {} ({})",
            key, instance.address, instance.protocol
        );
        Ok(())
    }

    /// Deregister a service instance.
    ///
    /// Revokes its lease when one is held, which deletes the key; falls
    /// back to a direct delete for keys this process never registered.
    pub async fn deregister(&self, instance: &ServiceInstance) -> RegistryResult<()> {
        let mut instance = instance.clone();
        instance.validate()?;
        let key = instance.build_key(&self.config.prefix);

        let lease = self.registered.write().await.remove(&key);
        match lease {
            Some(id) => self.kv.revoke(id).await?,
            None => self.kv.delete(&key).await?,
        }

        info!("deregistered: {}", key);
        Ok(())
    }

    /// List all instances of a service
    pub async fn discover(&self, service_name: &str) -> RegistryResult<Vec<ServiceInstance>> {
        let prefix = service_prefix(&self.config.prefix, service_name);
        let pairs = self.kv.get_prefix(&prefix).await?;

        let mut instances = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match ServiceInstance::unmarshal(value.as_bytes()) {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    warn!("skip bad instance {}: {}", key, e);
                }
            }
        }
        Ok(instances)
    }

    /// List instances of a service speaking the given protocol
    pub async fn discover_by_protocol(
        &self,
        service_name: &str,
        protocol: Protocol,
    ) -> RegistryResult<Vec<ServiceInstance>> {
        let all = self.discover(service_name).await?;
        Ok(all
            .into_iter()
            .filter(|inst| inst.protocol == protocol)
            .collect())
    }

    /// Watch a service for instance changes until `cancel` fires or the
    /// upstream stream ends.
    ///
    /// Put events carry the deserialized instance; delete events carry
    /// only the deleted key in `instance.id`.
    pub async fn watch(
        &self,
        service_name: &str,
        cancel: CancellationToken,
    ) -> RegistryResult<mpsc::Receiver<WatchEvent>> {
        let prefix = service_prefix(&self.config.prefix, service_name);
        let mut raw = self.kv.watch_prefix(&prefix, cancel).await?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(async move {
            while let Some(kv_event) = raw.recv().await {
                let event = match kv_event.kind {
                    KvEventKind::Put => {
                        let instance = match ServiceInstance::unmarshal(kv_event.value.as_bytes())
                        {
                            Ok(instance) => instance,
                            Err(_) => continue,
                        };
                        WatchEvent {
                            event_type: EventType::Put,
                            instance,
                        }
                    }
                    KvEventKind::Delete => {
                        // the KV layer only knows the key here
                        let mut instance =
                            ServiceInstance::new(String::new(), String::new(), Protocol::Http);
                        instance.id = kv_event.key;
                        WatchEvent {
                            event_type: EventType::Delete,
                            instance,
                        }
                    }
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    /// Revoke all outstanding leases.
    ///
    /// Individual revoke failures are logged without aborting the rest.
    pub async fn close(&self) {
        let leases: Vec<(String, LeaseId)> = {
            let registered = self.registered.read().await;
            registered
                .iter()
                .map(|(key, id)| (key.clone(), *id))
                .collect()
        };

        for (key, lease) in leases {
            if let Err(e) = self.kv.revoke(lease).await {
                warn!("revoke {} failed: {}", key, e);
            }
        }

        self.registered.write().await.clear();
    }
}
