//! In-memory KV store with lease expiry and prefix watches
//!
//! Behaves like the real backend closely enough to drive the registry and
//! resolver in tests and local development: leases expire unless renewed,
//! revocation deletes bound keys, and watchers observe changes in order.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RegistryError, RegistryResult};
use crate::kv::{KvEvent, KvEventKind, KvStore, LeaseId, WATCH_BUFFER};

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    watchers: Vec<Watcher>,
}

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    expires_at: Instant,
}

struct Watcher {
    id: u64,
    prefix: String,
    tx: mpsc::Sender<KvEvent>,
}

/// In-process [`KvStore`] implementation
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    next_lease: Arc<AtomicI64>,
    next_watcher: Arc<AtomicU64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            next_lease: Arc::new(AtomicI64::new(1)),
            next_watcher: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Drop every active watch stream, simulating a server-side
    /// disconnect. Consumers see their channels close and must reconcile
    /// with a full read.
    pub async fn disconnect_watchers(&self) {
        let mut inner = self.inner.lock().await;
        inner.watchers.clear();
    }
}

/// Deliver an event to every watcher whose prefix covers the key.
///
/// Sends happen under the store lock so watchers observe mutations in the
/// order they were applied.
async fn broadcast(inner: &mut Inner, event: KvEvent) {
    inner.watchers.retain(|w| !w.tx.is_closed());
    for watcher in &inner.watchers {
        if event.key.starts_with(&watcher.prefix) {
            let _ = watcher.tx.send(event.clone()).await;
        }
    }
}

/// Drop a lease and delete every key bound to it, notifying watchers.
async fn expire_lease(inner: &mut Inner, lease: LeaseId) {
    if inner.leases.remove(&lease).is_none() {
        return;
    }
    let keys: Vec<String> = inner
        .data
        .iter()
        .filter(|(_, entry)| entry.lease == Some(lease))
        .map(|(key, _)| key.clone())
        .collect();
    for key in keys {
        inner.data.remove(&key);
        broadcast(
            inner,
            KvEvent {
                kind: KvEventKind::Delete,
                key,
                value: String::new(),
            },
        )
        .await;
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn grant(&self, ttl_secs: i64) -> RegistryResult<LeaseId> {
        if ttl_secs <= 0 {
            return Err(RegistryError::Validation(
                "lease ttl must be positive".to_string(),
            ));
        }
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let ttl = Duration::from_secs(ttl_secs as u64);
        {
            let mut inner = self.inner.lock().await;
            inner.leases.insert(
                id,
                Lease {
                    ttl,
                    expires_at: Instant::now() + ttl,
                },
            );
        }

        // Expiry task: sleeps to the current deadline and re-checks, since
        // renewals may have pushed it out in the meantime.
        let store = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let inner = store.lock().await;
                    match inner.leases.get(&id) {
                        Some(lease) => lease.expires_at,
                        None => return,
                    }
                };
                tokio::time::sleep_until(deadline).await;
                let mut inner = store.lock().await;
                match inner.leases.get(&id) {
                    Some(lease) if lease.expires_at <= Instant::now() => {
                        expire_lease(&mut inner, id).await;
                        return;
                    }
                    Some(_) => continue,
                    None => return,
                }
            }
        });

        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<mpsc::Receiver<()>> {
        let ttl = {
            let inner = self.inner.lock().await;
            match inner.leases.get(&lease) {
                Some(l) => l.ttl,
                None => {
                    return Err(RegistryError::Backend(format!("lease {} not found", lease)))
                }
            }
        };

        let (tx, rx) = mpsc::channel(1);
        let store = self.inner.clone();
        let interval = ttl / 3;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                {
                    let mut inner = store.lock().await;
                    match inner.leases.get_mut(&lease) {
                        Some(l) => l.expires_at = Instant::now() + l.ttl,
                        // lease lost; close the ack channel
                        None => break,
                    }
                }
                if tx.send(()).await.is_err() {
                    // consumer gone, stop renewing and let the lease lapse
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> RegistryResult<()> {
        let mut inner = self.inner.lock().await;
        expire_lease(&mut inner, lease).await;
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> RegistryResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(id) = lease {
            if !inner.leases.contains_key(&id) {
                return Err(RegistryError::Backend(format!("lease {} not found", id)));
            }
        }
        inner.data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        broadcast(
            &mut inner,
            KvEvent {
                kind: KvEventKind::Put,
                key: key.to_string(),
                value: value.to_string(),
            },
        )
        .await;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> RegistryResult<Vec<(String, String)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> RegistryResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.data.remove(key).is_some() {
            broadcast(
                &mut inner,
                KvEvent {
                    kind: KvEventKind::Delete,
                    key: key.to_string(),
                    value: String::new(),
                },
            )
            .await;
        }
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> RegistryResult<mpsc::Receiver<KvEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock().await;
            inner.watchers.push(Watcher {
                id,
                prefix: prefix.to_string(),
                tx,
            });
        }

        let store = self.inner.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            let mut inner = store.lock().await;
            // dropping the sender closes the consumer's channel
            inner.watchers.retain(|w| w.id != id);
        });

        Ok(rx)
    }
}
