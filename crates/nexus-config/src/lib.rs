//! Configuration center for the Nexus control plane.
//!
//! Stores draft/published configuration items per namespace, rolls drafts
//! out to a deterministic slice of clients via gray rules, and delivers
//! changes through a fingerprint-based long-poll protocol. The [`client`]
//! module is the SDK consumed by services and the gateway.

pub mod admin;
pub mod client;
pub mod error;
pub mod format;
pub mod gray;
pub mod notifier;
pub mod server;
pub mod storage;
pub mod types;

pub use client::{ClientConfig, ConfigClient};
pub use error::{ConfigError, ConfigResult};
pub use notifier::ConfigNotifier;
pub use storage::{MemoryStorage, Storage};
pub use types::{ConfigFormat, ConfigItem, ConfigNamespace, ConfigVersion, GrayRule};

/// Service name
pub const CONFIG_CENTER_NAME: &str = "nexus-config";

/// Service version
pub const CONFIG_CENTER_VERSION: &str = env!("CARGO_PKG_VERSION");
