//! Core types for service registration and discovery

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{RegistryError, RegistryResult};

/// Transport protocol spoken by a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Grpc,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Http
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Grpc => write!(f, "grpc"),
        }
    }
}

/// A single service instance as stored in the KV registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique instance identifier; defaults to `address` when unset
    #[serde(default)]
    pub id: String,

    /// Service name
    pub name: String,

    /// Service version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Transport protocol (http / grpc)
    #[serde(default)]
    pub protocol: Protocol,

    /// Listen address as host:port
    pub address: String,

    /// Load balancing weight, defaults to 1
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Extension metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

impl ServiceInstance {
    /// Create an instance with the given name, address and protocol
    pub fn new(name: impl Into<String>, address: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            version: None,
            protocol,
            address: address.into(),
            weight: 1,
            metadata: HashMap::new(),
        }
    }

    /// Validate the instance and fill in defaults
    pub fn validate(&mut self) -> RegistryResult<()> {
        if self.name.is_empty() {
            return Err(RegistryError::Validation(
                "service name cannot be empty".to_string(),
            ));
        }
        if self.address.is_empty() {
            return Err(RegistryError::Validation(
                "service address cannot be empty".to_string(),
            ));
        }
        if self.id.is_empty() {
            self.id = self.address.clone();
        }
        if self.weight == 0 {
            self.weight = 1;
        }
        Ok(())
    }

    /// Serialize to the JSON wire representation
    pub fn marshal(&self) -> RegistryResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the JSON wire representation
    pub fn unmarshal(data: &[u8]) -> RegistryResult<ServiceInstance> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Build the KV key for this instance: `{prefix}/{name}/{id}`
    pub fn build_key(&self, prefix: &str) -> String {
        format!("{}/{}/{}", prefix, self.name, self.id)
    }
}

/// Build the KV prefix covering all instances of a service: `{prefix}/{name}/`
pub fn service_prefix(prefix: &str, name: &str) -> String {
    format!("{}/{}/", prefix, name)
}

/// Kind of a service change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Instance added or updated
    Put,
    /// Instance removed
    Delete,
}

/// A service change event produced by a registry watch
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub instance: ServiceInstance,
}
