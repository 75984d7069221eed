//! In-memory metadata store for tests and embedded single-process use.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{conflict, MetadataStore, Versioned, ABSENT};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Versioned>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: serde_json::Value, expected_version: u64) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key).map(|e| e.version).unwrap_or(ABSENT);
        if current != expected_version {
            return Err(conflict(key, expected_version, current));
        }
        let version = expected_version + 1;
        entries.insert(key.to_string(), Versioned { value, version });
        Ok(version)
    }

    async fn delete(&self, key: &str, expected_version: u64) -> Result<()> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key).map(|e| e.version).unwrap_or(ABSENT);
        if current != expected_version {
            return Err(conflict(key, expected_version, current));
        }
        entries.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
