//! Static bootstrap configuration for the gateway
//!
//! Loaded once from TOML at startup. Everything that may change at
//! runtime lives in [`crate::dynamic::DynamicConfig`] instead.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use nexus_config::ClientConfig;
use nexus_registry::RegistryConfig;

use crate::error::GatewayError;

/// Top-level static configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub registry: RegistrySection,

    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub config_center: ConfigCenterSection,

    #[serde(default)]
    pub timeout: TimeoutSection,

    #[serde(default)]
    pub metrics: MetricsSection,

    #[serde(default)]
    pub grpc: GrpcSection,
}

/// Registry (etcd) connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    pub endpoints: Vec<String>,

    /// Dial timeout in seconds
    pub dial_timeout: u64,

    pub prefix: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            dial_timeout: 5,
            prefix: "/nexus/services".to_string(),
            username: None,
            password: None,
        }
    }
}

impl RegistrySection {
    /// SDK-level registry configuration
    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            endpoints: self.endpoints.clone(),
            dial_timeout_secs: self.dial_timeout,
            prefix: self.prefix.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            ..Default::default()
        }
    }
}

/// Listen address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub addr: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Config center SDK coordinates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigCenterSection {
    pub server_addr: String,
    pub namespace: String,
    pub config_key: String,
    pub client_id: String,
    pub poll_timeout: u64,
    pub retry_delay: u64,
}

impl Default for ConfigCenterSection {
    fn default() -> Self {
        Self {
            server_addr: "http://127.0.0.1:8888".to_string(),
            namespace: "nexus-gateway".to_string(),
            config_key: "gateway.yaml".to_string(),
            client_id: String::new(),
            poll_timeout: 30,
            retry_delay: 5,
        }
    }
}

impl ConfigCenterSection {
    /// SDK-level client configuration; an empty client id falls back to
    /// the host name so gray slices stay stable per machine.
    pub fn to_client_config(&self) -> ClientConfig {
        let client_id = if self.client_id.is_empty() {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "nexus-gateway".to_string())
        } else {
            self.client_id.clone()
        };
        ClientConfig {
            server_addr: self.server_addr.clone(),
            namespace: self.namespace.clone(),
            config_key: self.config_key.clone(),
            client_id,
            poll_timeout_secs: self.poll_timeout,
            retry_delay_secs: self.retry_delay,
        }
    }
}

/// Backend call timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSection {
    pub connect_ms: u64,
    pub response_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_ms: 3000,
            response_ms: 10_000,
        }
    }
}

impl TimeoutSection {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn response(&self) -> Duration {
        Duration::from_millis(self.response_ms)
    }
}

/// Prometheus exposition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSection {
    pub enabled: bool,
    pub path: String,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/metrics".to_string(),
        }
    }
}

/// gRPC transcoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcSection {
    pub reflection_cache_ttl_sec: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for GrpcSection {
    fn default() -> Self {
        Self {
            reflection_cache_ttl_sec: 300,
            connect_timeout_ms: 3000,
            request_timeout_ms: 10_000,
        }
    }
}

impl GrpcSection {
    pub fn reflection_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.reflection_cache_ttl_sec)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl GatewayConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Configuration(format!("read config {}: {}", path.display(), e))
        })?;
        let config: GatewayConfig = toml::from_str(&content).map_err(|e| {
            GatewayError::Configuration(format!("parse config {}: {}", path.display(), e))
        })?;
        Ok(config)
    }
}
