//! Fan-out of configuration change events to waiting pollers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::ConfigVersion;

struct Subscription {
    token: u64,
    tx: mpsc::Sender<ConfigVersion>,
}

/// Subscribe/publish hub keyed by `namespace/key`.
///
/// Each subscriber owns a capacity-1 channel; deliveries never block and
/// are dropped when a subscriber already has a pending event. Dropped
/// deliveries are safe because clients reconcile on fingerprint at their
/// next poll.
#[derive(Default)]
pub struct ConfigNotifier {
    listeners: RwLock<HashMap<String, Vec<Subscription>>>,
    next_token: AtomicU64,
}

/// Active subscription; dropping it unsubscribes, so a poll handler that
/// is cancelled mid-hold still cleans up.
pub struct SubscriptionGuard<'a> {
    notifier: &'a ConfigNotifier,
    config_key: String,
    token: u64,
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.notifier.remove(&self.config_key, self.token);
    }
}

impl ConfigNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn config_key(namespace: &str, key: &str) -> String {
        format!("{}/{}", namespace, key)
    }

    /// Register a subscriber for changes to `namespace/key`
    pub fn subscribe(
        &self,
        namespace: &str,
        key: &str,
    ) -> (SubscriptionGuard<'_>, mpsc::Receiver<ConfigVersion>) {
        let config_key = Self::config_key(namespace, key);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);

        let mut listeners = self.listeners.write().expect("listener map poisoned");
        listeners
            .entry(config_key.clone())
            .or_default()
            .push(Subscription { token, tx });

        (
            SubscriptionGuard {
                notifier: self,
                config_key,
                token,
            },
            rx,
        )
    }

    fn remove(&self, config_key: &str, token: u64) {
        let mut listeners = self.listeners.write().expect("listener map poisoned");
        if let Some(subs) = listeners.get_mut(config_key) {
            subs.retain(|sub| sub.token != token);
            if subs.is_empty() {
                listeners.remove(config_key);
            }
        }
    }

    /// Notify every subscriber of `namespace/key` about a new version.
    ///
    /// Non-blocking: a subscriber whose buffer is full misses this event.
    pub fn notify(&self, version: &ConfigVersion) {
        let config_key = Self::config_key(&version.namespace, &version.key);
        let listeners = self.listeners.read().expect("listener map poisoned");
        let Some(subs) = listeners.get(&config_key) else {
            return;
        };

        debug!(
            "notifying {} listeners for config: {}",
            subs.len(),
            config_key
        );
        for sub in subs {
            if sub.tx.try_send(version.clone()).is_err() {
                warn!("listener channel full for config: {}", config_key);
            }
        }
    }

    /// Block until a change for `namespace/key` arrives or `timeout`
    /// elapses. Returns `None` on timeout. The subscription is removed on
    /// every exit path, including caller cancellation.
    pub async fn wait_for_change(
        &self,
        namespace: &str,
        key: &str,
        timeout: Duration,
    ) -> Option<ConfigVersion> {
        let (_guard, mut rx) = self.subscribe(namespace, key);

        tokio::select! {
            version = rx.recv() => version,
            _ = tokio::time::sleep(timeout) => None,
        }
    }

    /// Number of live subscriptions for `namespace/key`
    pub fn subscriber_count(&self, namespace: &str, key: &str) -> usize {
        let listeners = self.listeners.read().expect("listener map poisoned");
        listeners
            .get(&Self::config_key(namespace, key))
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}
