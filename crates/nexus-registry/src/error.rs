//! Error types for the registry SDK

use thiserror::Error;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error type for registry operations
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("No available instance for {0}")]
    NoInstance(String),
}

impl From<etcd_client::Error> for RegistryError {
    fn from(err: etcd_client::Error) -> Self {
        RegistryError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Serialization(err.to_string())
    }
}
