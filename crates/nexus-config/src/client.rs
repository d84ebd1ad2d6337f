//! Configuration center SDK client
//!
//! Fetches the effective configuration once at startup, then keeps it
//! fresh through the long-poll endpoint. Changes land in a local cache
//! and are fanned out to registered listeners.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::format::parse_config;
use crate::types::{ConfigFormat, ConfigVersion};

/// Callback invoked with every changed configuration version
pub type ChangeListener = Arc<dyn Fn(&ConfigVersion) + Send + Sync>;

/// Connection settings for the config center
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the config center, e.g. `http://127.0.0.1:8888`
    pub server_addr: String,

    pub namespace: String,
    pub config_key: String,
    pub client_id: String,

    /// Server-side hold time; the client allows this plus a margin
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Delay before retrying after a failed poll
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_retry_delay() -> u64 {
    5
}

#[derive(Default)]
struct ConfigCache {
    configs: RwLock<HashMap<String, ConfigVersion>>,
}

impl ConfigCache {
    async fn get(&self, namespace: &str, key: &str) -> Option<ConfigVersion> {
        self.configs
            .read()
            .await
            .get(&format!("{}/{}", namespace, key))
            .cloned()
    }

    async fn set(&self, version: ConfigVersion) {
        self.configs
            .write()
            .await
            .insert(format!("{}/{}", version.namespace, version.key), version);
    }
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    changed: bool,
    version: Option<ConfigVersion>,
}

/// Config center client with a background long-poll loop
pub struct ConfigClient {
    config: ClientConfig,
    cache: Arc<ConfigCache>,
    http: reqwest::Client,
    poll_http: reqwest::Client,
    listeners: Arc<RwLock<Vec<ChangeListener>>>,
    cancel: CancellationToken,
}

impl ConfigClient {
    pub fn new(config: ClientConfig) -> ConfigResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        // The poll request hangs for the server hold time; give it room.
        let poll_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs + 10))
            .build()?;

        Ok(Self {
            config,
            cache: Arc::new(ConfigCache::default()),
            http,
            poll_http,
            listeners: Arc::new(RwLock::new(Vec::new())),
            cancel: CancellationToken::new(),
        })
    }

    /// Fetch once, then start the background long-poll loop.
    ///
    /// A failed initial fetch is logged, not fatal; the poll loop will
    /// pick the configuration up as soon as the server is reachable.
    pub async fn start(&self) {
        info!(
            "config client starting, namespace={}, key={}",
            self.config.namespace, self.config.config_key
        );

        if let Err(e) = self.fetch().await {
            warn!("initial config fetch failed: {}", e);
        }

        let config = self.config.clone();
        let cache = self.cache.clone();
        let poll_http = self.poll_http.clone();
        let listeners = self.listeners.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = poll_once(&config, &cache, &poll_http, &listeners) => {}
                }
            }
            info!("config client stopped");
        });
    }

    /// Stop the background loop
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Current cached configuration version
    pub async fn get_config(&self) -> ConfigResult<ConfigVersion> {
        self.cache
            .get(&self.config.namespace, &self.config.config_key)
            .await
            .ok_or_else(|| ConfigError::NotFound("config not in cache".to_string()))
    }

    /// Current configuration content
    pub async fn get_value(&self) -> ConfigResult<String> {
        Ok(self.get_config().await?.value)
    }

    /// Parse the current configuration into a typed value
    pub async fn get_value_as<T: DeserializeOwned>(&self) -> ConfigResult<T> {
        let version = self.get_config().await?;
        let format: ConfigFormat =
            serde_json::from_value(serde_json::Value::String(version.format.clone()))
                .unwrap_or_default();
        parse_config(&version.value, format)
    }

    /// Register a listener invoked on every configuration change
    pub async fn add_change_listener(&self, listener: ChangeListener) {
        self.listeners.write().await.push(listener);
    }

    /// Fetch the effective configuration immediately
    pub async fn fetch(&self) -> ConfigResult<()> {
        let url = format!("{}/api/v1/config/get", self.config.server_addr);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "namespace": self.config.namespace,
                "key": self.config.config_key,
                "client_id": self.config.client_id,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ConfigError::NotFound(format!(
                "config fetch returned {}",
                response.status()
            )));
        }

        let version: ConfigVersion = response.json().await?;
        info!(
            "config fetched: {}/{} md5={}",
            version.namespace, version.key, version.md5
        );
        self.cache.set(version).await;
        Ok(())
    }
}

/// One long-poll round trip; sleeps the retry delay on failure
async fn poll_once(
    config: &ClientConfig,
    cache: &Arc<ConfigCache>,
    poll_http: &reqwest::Client,
    listeners: &Arc<RwLock<Vec<ChangeListener>>>,
) {
    let current_md5 = cache
        .get(&config.namespace, &config.config_key)
        .await
        .map(|v| v.md5)
        .unwrap_or_default();

    let url = format!("{}/api/v1/config/poll", config.server_addr);
    let result = poll_http
        .post(&url)
        .json(&serde_json::json!({
            "namespace": config.namespace,
            "key": config.config_key,
            "client_id": config.client_id,
            "md5": current_md5,
        }))
        .send()
        .await;

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            warn!("config poll failed: {}", e);
            tokio::time::sleep(Duration::from_secs(config.retry_delay_secs)).await;
            return;
        }
    };

    let poll: PollResponse = match response.json().await {
        Ok(poll) => poll,
        Err(e) => {
            warn!("config poll parse failed: {}", e);
            tokio::time::sleep(Duration::from_secs(config.retry_delay_secs)).await;
            return;
        }
    };

    if poll.changed {
        if let Some(version) = poll.version {
            info!(
                "config changed: {}/{} md5={}",
                version.namespace, version.key, version.md5
            );
            cache.set(version.clone()).await;
            for listener in listeners.read().await.iter() {
                listener(&version);
            }
        }
    }
}
