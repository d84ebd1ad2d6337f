//! Core types for the configuration center

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported configuration payload formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
    Properties,
}

impl Default for ConfigFormat {
    fn default() -> Self {
        ConfigFormat::Yaml
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigFormat::Yaml => write!(f, "yaml"),
            ConfigFormat::Json => write!(f, "json"),
            ConfigFormat::Toml => write!(f, "toml"),
            ConfigFormat::Properties => write!(f, "properties"),
        }
    }
}

/// A namespace groups the configuration of one application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigNamespace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A configuration item with a draft slot and a published slot.
///
/// The md5 fields always hold the digest of the corresponding value;
/// publishing copies the draft slot into the published slot atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigItem {
    pub namespace: String,
    pub key: String,
    #[serde(default)]
    pub format: ConfigFormat,

    #[serde(default)]
    pub draft_value: String,
    #[serde(default)]
    pub draft_md5: String,

    #[serde(default)]
    pub published_value: String,
    #[serde(default)]
    pub published_md5: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Gray-release rule: route `percentage` percent of clients to the draft
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrayRule {
    pub namespace: String,
    pub key: String,
    /// 0 - 100
    #[serde(default)]
    pub percentage: u32,
    #[serde(default)]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The effective configuration version returned to a polling client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigVersion {
    pub namespace: String,
    pub key: String,
    pub md5: String,
    pub value: String,
    pub format: String,
}

/// MD5 fingerprint of a configuration value, as a lowercase hex string
pub fn fingerprint(value: &str) -> String {
    format!("{:x}", md5::compute(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_md5_hex() {
        assert_eq!(fingerprint(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(fingerprint("k: 1"), format!("{:x}", md5::compute(b"k: 1")));
    }

    #[test]
    fn format_round_trips_through_serde() {
        let json = serde_json::to_string(&ConfigFormat::Properties).unwrap();
        assert_eq!(json, "\"properties\"");
        let parsed: ConfigFormat = serde_json::from_str("\"toml\"").unwrap();
        assert_eq!(parsed, ConfigFormat::Toml);
    }
}
