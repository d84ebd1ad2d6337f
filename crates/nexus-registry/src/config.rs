//! Configuration for the registry SDK

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RegistryError, RegistryResult};

/// Default key prefix for registered services
pub const DEFAULT_PREFIX: &str = "/nexus/services";

/// Configuration for connecting to the registry backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// KV store endpoints
    pub endpoints: Vec<String>,

    /// Dial timeout in seconds
    pub dial_timeout_secs: u64,

    /// Lease TTL in seconds for registered instances
    pub lease_ttl_secs: i64,

    /// Key prefix for all registered services
    pub prefix: String,

    /// Optional authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            dial_timeout_secs: 5,
            lease_ttl_secs: 10,
            prefix: DEFAULT_PREFIX.to_string(),
            username: None,
            password: None,
        }
    }
}

impl RegistryConfig {
    /// Validate the configuration
    pub fn validate(&self) -> RegistryResult<()> {
        if self.endpoints.is_empty() {
            return Err(RegistryError::Validation(
                "at least one endpoint is required".to_string(),
            ));
        }
        if self.lease_ttl_secs < 2 {
            return Err(RegistryError::Validation(
                "lease ttl must be at least 2 seconds".to_string(),
            ));
        }
        Ok(())
    }

    /// Dial timeout as a [`Duration`]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Interval between lease renewals, at most a third of the TTL
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs((self.lease_ttl_secs as u64 / 3).max(1))
    }
}
