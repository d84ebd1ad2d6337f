//! Service registry SDK for the Nexus control plane.
//!
//! Provides lease-bound ephemeral registration against a consistent KV
//! store, prefix-scoped watch streams, and a client-side [`Resolver`] that
//! keeps a live view of a service's instance set with pluggable load
//! balancing.

pub mod balancer;
pub mod config;
pub mod error;
pub mod kv;
pub mod registry;
pub mod resolver;
pub mod types;

pub use config::RegistryConfig;
pub use error::{RegistryError, RegistryResult};
pub use registry::Registry;
pub use resolver::{Resolver, ResolverOptions};
pub use types::{EventType, Protocol, ServiceInstance, WatchEvent};

/// SDK name
pub const SDK_NAME: &str = "nexus-registry";

/// SDK version
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
