//! Storage backends for the configuration center
//!
//! The [`Storage`] trait is the seam towards the persistent store; the
//! in-memory implementation backs tests and single-node deployments.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{ConfigError, ConfigResult};
use crate::types::{fingerprint, ConfigFormat, ConfigItem, ConfigNamespace, GrayRule};

/// Storage backend trait for namespaces, config items and gray rules
#[async_trait]
pub trait Storage: Send + Sync {
    // === Namespace operations ===

    async fn create_namespace(&self, ns: ConfigNamespace) -> ConfigResult<()>;
    async fn get_namespace(&self, id: &str) -> ConfigResult<ConfigNamespace>;
    async fn list_namespaces(&self) -> ConfigResult<Vec<ConfigNamespace>>;
    async fn delete_namespace(&self, id: &str) -> ConfigResult<()>;

    // === Config item operations ===

    /// Save (or update) the draft slot of a config item
    async fn save_draft(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        format: ConfigFormat,
    ) -> ConfigResult<()>;

    async fn get_draft(&self, namespace: &str, key: &str) -> ConfigResult<ConfigItem>;

    /// Atomically copy the draft slot into the published slot
    async fn publish_config(&self, namespace: &str, key: &str) -> ConfigResult<()>;

    /// Fetch an item that has been published at least once
    async fn get_published_config(&self, namespace: &str, key: &str) -> ConfigResult<ConfigItem>;

    async fn list_configs(&self, namespace: &str) -> ConfigResult<Vec<ConfigItem>>;
    async fn delete_config(&self, namespace: &str, key: &str) -> ConfigResult<()>;

    // === Gray rule operations ===

    async fn save_gray_rule(&self, rule: GrayRule) -> ConfigResult<()>;
    async fn get_gray_rule(&self, namespace: &str, key: &str) -> ConfigResult<GrayRule>;
    async fn delete_gray_rule(&self, namespace: &str, key: &str) -> ConfigResult<()>;
    async fn list_gray_rules(&self, namespace: &str) -> ConfigResult<Vec<GrayRule>>;
}

fn config_key(namespace: &str, key: &str) -> String {
    format!("{}/{}", namespace, key)
}

/// In-memory storage implementation
#[derive(Default)]
pub struct MemoryStorage {
    namespaces: Arc<RwLock<HashMap<String, ConfigNamespace>>>,
    items: Arc<RwLock<HashMap<String, ConfigItem>>>,
    gray_rules: Arc<RwLock<HashMap<String, GrayRule>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_namespace(&self, ns: ConfigNamespace) -> ConfigResult<()> {
        let mut namespaces = self.namespaces.write().await;
        if namespaces.contains_key(&ns.id) {
            return Err(ConfigError::Validation(format!(
                "namespace {} already exists",
                ns.id
            )));
        }
        namespaces.insert(ns.id.clone(), ns);
        Ok(())
    }

    async fn get_namespace(&self, id: &str) -> ConfigResult<ConfigNamespace> {
        self.namespaces
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(format!("namespace {}", id)))
    }

    async fn list_namespaces(&self) -> ConfigResult<Vec<ConfigNamespace>> {
        let mut list: Vec<ConfigNamespace> =
            self.namespaces.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn delete_namespace(&self, id: &str) -> ConfigResult<()> {
        self.namespaces.write().await.remove(id);
        self.items
            .write()
            .await
            .retain(|_, item| item.namespace != id);
        self.gray_rules
            .write()
            .await
            .retain(|_, rule| rule.namespace != id);
        Ok(())
    }

    async fn save_draft(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        format: ConfigFormat,
    ) -> ConfigResult<()> {
        let now = Utc::now();
        let draft_md5 = fingerprint(value);
        let mut items = self.items.write().await;

        match items.get_mut(&config_key(namespace, key)) {
            Some(item) => {
                item.draft_value = value.to_string();
                item.draft_md5 = draft_md5;
                item.format = format;
                item.updated_at = now;
            }
            None => {
                items.insert(
                    config_key(namespace, key),
                    ConfigItem {
                        namespace: namespace.to_string(),
                        key: key.to_string(),
                        format,
                        draft_value: value.to_string(),
                        draft_md5,
                        published_value: String::new(),
                        published_md5: String::new(),
                        published_at: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_draft(&self, namespace: &str, key: &str) -> ConfigResult<ConfigItem> {
        self.items
            .read()
            .await
            .get(&config_key(namespace, key))
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(format!("config {}/{}", namespace, key)))
    }

    async fn publish_config(&self, namespace: &str, key: &str) -> ConfigResult<()> {
        let mut items = self.items.write().await;
        let item = items
            .get_mut(&config_key(namespace, key))
            .ok_or_else(|| ConfigError::NotFound(format!("config {}/{}", namespace, key)))?;

        let now = Utc::now();
        item.published_value = item.draft_value.clone();
        item.published_md5 = item.draft_md5.clone();
        item.published_at = Some(now);
        item.updated_at = now;
        Ok(())
    }

    async fn get_published_config(&self, namespace: &str, key: &str) -> ConfigResult<ConfigItem> {
        let item = self.get_draft(namespace, key).await?;
        if item.published_at.is_none() {
            return Err(ConfigError::NotFound(format!(
                "published config {}/{}",
                namespace, key
            )));
        }
        Ok(item)
    }

    async fn list_configs(&self, namespace: &str) -> ConfigResult<Vec<ConfigItem>> {
        let mut list: Vec<ConfigItem> = self
            .items
            .read()
            .await
            .values()
            .filter(|item| item.namespace == namespace)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(list)
    }

    async fn delete_config(&self, namespace: &str, key: &str) -> ConfigResult<()> {
        self.items.write().await.remove(&config_key(namespace, key));
        Ok(())
    }

    async fn save_gray_rule(&self, rule: GrayRule) -> ConfigResult<()> {
        if rule.percentage > 100 {
            return Err(ConfigError::Validation(
                "gray percentage must be within 0..=100".to_string(),
            ));
        }
        let mut rules = self.gray_rules.write().await;
        rules.insert(config_key(&rule.namespace, &rule.key), rule);
        Ok(())
    }

    async fn get_gray_rule(&self, namespace: &str, key: &str) -> ConfigResult<GrayRule> {
        self.gray_rules
            .read()
            .await
            .get(&config_key(namespace, key))
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(format!("gray rule {}/{}", namespace, key)))
    }

    async fn delete_gray_rule(&self, namespace: &str, key: &str) -> ConfigResult<()> {
        self.gray_rules
            .write()
            .await
            .remove(&config_key(namespace, key));
        Ok(())
    }

    async fn list_gray_rules(&self, namespace: &str) -> ConfigResult<Vec<GrayRule>> {
        let mut list: Vec<GrayRule> = self
            .gray_rules
            .read()
            .await
            .values()
            .filter(|rule| rule.namespace == namespace)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn draft_then_publish_copies_slots() {
        let storage = MemoryStorage::new();
        storage
            .save_draft("myapp", "app.yaml", "k: 1", ConfigFormat::Yaml)
            .await
            .unwrap();

        // unpublished items are not visible to pollers
        assert!(storage
            .get_published_config("myapp", "app.yaml")
            .await
            .is_err());

        storage.publish_config("myapp", "app.yaml").await.unwrap();
        let item = storage
            .get_published_config("myapp", "app.yaml")
            .await
            .unwrap();
        assert_eq!(item.published_value, "k: 1");
        assert_eq!(item.published_md5, fingerprint("k: 1"));
        assert!(item.published_at.is_some());

        // a new draft leaves the published slot untouched
        storage
            .save_draft("myapp", "app.yaml", "k: 2", ConfigFormat::Yaml)
            .await
            .unwrap();
        let item = storage
            .get_published_config("myapp", "app.yaml")
            .await
            .unwrap();
        assert_eq!(item.published_value, "k: 1");
        assert_eq!(item.draft_value, "k: 2");
    }

    #[tokio::test]
    async fn namespace_delete_cascades() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage
            .create_namespace(ConfigNamespace {
                id: "myapp".to_string(),
                name: "My App".to_string(),
                description: String::new(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        storage
            .save_draft("myapp", "app.yaml", "k: 1", ConfigFormat::Yaml)
            .await
            .unwrap();
        storage
            .save_gray_rule(GrayRule {
                namespace: "myapp".to_string(),
                key: "app.yaml".to_string(),
                percentage: 50,
                enabled: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        storage.delete_namespace("myapp").await.unwrap();
        assert!(storage.get_draft("myapp", "app.yaml").await.is_err());
        assert!(storage.get_gray_rule("myapp", "app.yaml").await.is_err());
    }

    #[tokio::test]
    async fn gray_rule_percentage_is_bounded() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let result = storage
            .save_gray_rule(GrayRule {
                namespace: "myapp".to_string(),
                key: "app.yaml".to_string(),
                percentage: 101,
                enabled: true,
                created_at: now,
                updated_at: now,
            })
            .await;
        assert!(result.is_err());
    }
}
