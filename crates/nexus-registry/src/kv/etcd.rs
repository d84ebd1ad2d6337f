//! etcd backend for the KV store interface

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RegistryConfig;
use crate::error::{RegistryError, RegistryResult};
use crate::kv::{KvEvent, KvEventKind, KvStore, LeaseId, WATCH_BUFFER};

/// KV store backed by an etcd cluster
pub struct EtcdStore {
    client: Client,
    config: RegistryConfig,
}

impl EtcdStore {
    /// Connect to etcd and verify the cluster is reachable
    pub async fn connect(config: RegistryConfig) -> RegistryResult<Self> {
        config.validate()?;

        let mut options = ConnectOptions::new().with_connect_timeout(config.dial_timeout());
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let mut client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| RegistryError::Backend(format!("connect etcd: {}", e)))?;

        // Health probe before handing the client out
        client
            .member_list()
            .await
            .map_err(|e| RegistryError::Backend(format!("etcd health check failed: {}", e)))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn grant(&self, ttl_secs: i64) -> RegistryResult<LeaseId> {
        let mut client = self.client.clone();
        let resp = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(|e| RegistryError::Backend(format!("grant lease: {}", e)))?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<mpsc::Receiver<()>> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease)
            .await
            .map_err(|e| RegistryError::Backend(format!("keepalive: {}", e)))?;

        let interval = self.config.keepalive_interval();
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if keeper.keep_alive().await.is_err() {
                    break;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        if tx.send(()).await.is_err() {
                            // consumer gone, stop renewing
                            break;
                        }
                    }
                    // ttl == 0 means the lease is gone
                    _ => break,
                }
            }
            debug!(lease, "lease renewal stopped");
        });

        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> RegistryResult<()> {
        let mut client = self.client.clone();
        match client.lease_revoke(lease).await {
            Ok(_) => Ok(()),
            // already expired or revoked
            Err(etcd_client::Error::GRpcStatus(status))
                if status.code() == tonic::Code::NotFound =>
            {
                Ok(())
            }
            Err(e) => Err(RegistryError::Backend(format!("revoke lease: {}", e))),
        }
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> RegistryResult<()> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client
            .put(key, value, options)
            .await
            .map_err(|e| RegistryError::Backend(format!("put {}: {}", key, e)))?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> RegistryResult<Vec<(String, String)>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| RegistryError::Backend(format!("get prefix {}: {}", prefix, e)))?;

        let mut pairs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            pairs.push((
                String::from_utf8_lossy(kv.key()).to_string(),
                String::from_utf8_lossy(kv.value()).to_string(),
            ));
        }
        Ok(pairs)
    }

    async fn delete(&self, key: &str) -> RegistryResult<()> {
        let mut client = self.client.clone();
        client
            .delete(key, None)
            .await
            .map_err(|e| RegistryError::Backend(format!("delete {}: {}", key, e)))?;
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> RegistryResult<mpsc::Receiver<KvEvent>> {
        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| RegistryError::Watch(format!("watch {}: {}", prefix, e)))?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let watched = prefix.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = watcher.cancel().await {
                            warn!("cancel watch {}: {}", watched, e);
                        }
                        break;
                    }
                    msg = stream.message() => {
                        let resp = match msg {
                            Ok(Some(resp)) => resp,
                            // stream lost; consumers reconcile via get_prefix
                            Ok(None) | Err(_) => break,
                        };
                        for ev in resp.events() {
                            let Some(kv) = ev.kv() else { continue };
                            let key = String::from_utf8_lossy(kv.key()).to_string();
                            let event = match ev.event_type() {
                                etcd_client::EventType::Put => KvEvent {
                                    kind: KvEventKind::Put,
                                    key,
                                    value: String::from_utf8_lossy(kv.value()).to_string(),
                                },
                                etcd_client::EventType::Delete => KvEvent {
                                    kind: KvEventKind::Delete,
                                    key,
                                    value: String::new(),
                                },
                            };
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                sent = tx.send(event) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
