//! Narrow KV store interface backing the registry
//!
//! The registry and resolver only ever talk to [`KvStore`]; concrete
//! backends (etcd, in-memory) plug in behind it.

pub mod etcd;
pub mod mem;

pub use etcd::EtcdStore;
pub use mem::MemoryStore;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RegistryResult;

/// Opaque lease identifier issued by the store
pub type LeaseId = i64;

/// Capacity of the event buffer handed to watch consumers
pub const WATCH_BUFFER: usize = 64;

/// Kind of a raw KV change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    Put,
    Delete,
}

/// A raw change observed on a watched prefix.
///
/// Delete events carry only the key; `value` is empty.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: String,
    pub value: String,
}

/// Capability interface over the backing KV store.
///
/// A `Put` bound to a lease is deleted by the store when the lease expires
/// or is revoked. `watch_prefix` delivers every change on the prefix in
/// order while the stream is alive; when the stream is lost the channel
/// closes and callers must reconcile with a full `get_prefix`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Grant a lease with the given TTL in seconds
    async fn grant(&self, ttl_secs: i64) -> RegistryResult<LeaseId>;

    /// Start renewing a lease in the background.
    ///
    /// The returned channel yields one acknowledgement per renewal and
    /// closes when the lease is lost or renewal stops.
    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<mpsc::Receiver<()>>;

    /// Revoke a lease, deleting every key bound to it. Idempotent.
    async fn revoke(&self, lease: LeaseId) -> RegistryResult<()>;

    /// Put a key, optionally bound to a lease
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> RegistryResult<()>;

    /// Range-read all keys under a prefix
    async fn get_prefix(&self, prefix: &str) -> RegistryResult<Vec<(String, String)>>;

    /// Delete a single key
    async fn delete(&self, key: &str) -> RegistryResult<()>;

    /// Watch a prefix for changes until `cancel` fires or the upstream
    /// stream ends. The buffer holds [`WATCH_BUFFER`] events; the producer
    /// blocks when it is full, preserving order.
    async fn watch_prefix(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> RegistryResult<mpsc::Receiver<KvEvent>>;
}
