//! Process-local durable store for tests and single-binary demos.
//!
//! Several repositories sharing one instance behave like nodes sharing one
//! database.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::{
    application::repos::{KeyValueStore, RepoError},
    cache::lock::{rw_read, rw_write},
    domain::entities::Entry,
};

const SOURCE: &str = "infra::memory";
const PRIMARY_KEY: &str = "key_values_pkey";

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    rows: RwLock<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a row directly, as a writer outside any node would.
    pub fn put(&self, key: &str, value: &str) {
        rw_write(&self.rows, SOURCE, "put").insert(key.to_string(), value.to_string());
    }

    /// Drop a row directly.
    pub fn forget(&self, key: &str) {
        rw_write(&self.rows, SOURCE, "forget").remove(key);
    }

    pub fn value(&self, key: &str) -> Option<String> {
        rw_read(&self.rows, SOURCE, "value").get(key).cloned()
    }

    /// All rows ordered by key.
    pub fn snapshot(&self) -> Vec<Entry> {
        rw_read(&self.rows, SOURCE, "snapshot")
            .iter()
            .map(|(key, value)| Entry::new(key.as_str(), value.as_str()))
            .collect()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn add(&self, entry: &Entry) -> Result<(), RepoError> {
        let mut rows = rw_write(&self.rows, SOURCE, "add");
        if rows.contains_key(&entry.key) {
            return Err(RepoError::Duplicate {
                constraint: PRIMARY_KEY.to_string(),
            });
        }
        rows.insert(entry.key.clone(), entry.value.clone());
        Ok(())
    }

    async fn try_get(&self, key: &str) -> Result<Option<String>, RepoError> {
        Ok(self.value(key))
    }

    async fn update(&self, entry: &Entry) -> Result<bool, RepoError> {
        let mut rows = rw_write(&self.rows, SOURCE, "update");
        match rows.get_mut(&entry.key) {
            Some(value) => {
                value.clone_from(&entry.value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, RepoError> {
        Ok(rw_write(&self.rows, SOURCE, "delete").remove(key).is_some())
    }

    async fn list_all(&self) -> Result<Vec<Entry>, RepoError> {
        Ok(self.snapshot())
    }
}

/// Store wrapper that stalls reads and writes, for interleaving tests.
///
/// Reads take their snapshot before stalling, so the caller receives what
/// the store held when the call began.
#[cfg(test)]
pub(crate) struct DelayedStore {
    pub inner: std::sync::Arc<MemoryKeyValueStore>,
    pub read_delay: std::time::Duration,
    pub write_delay: std::time::Duration,
}

#[cfg(test)]
#[async_trait]
impl KeyValueStore for DelayedStore {
    async fn add(&self, entry: &Entry) -> Result<(), RepoError> {
        self.inner.add(entry).await
    }

    async fn try_get(&self, key: &str) -> Result<Option<String>, RepoError> {
        let value = self.inner.try_get(key).await;
        tokio::time::sleep(self.read_delay).await;
        value
    }

    async fn update(&self, entry: &Entry) -> Result<bool, RepoError> {
        tokio::time::sleep(self.write_delay).await;
        self.inner.update(entry).await
    }

    async fn delete(&self, key: &str) -> Result<bool, RepoError> {
        self.inner.delete(key).await
    }

    async fn list_all(&self) -> Result<Vec<Entry>, RepoError> {
        let entries = self.inner.list_all().await;
        tokio::time::sleep(self.read_delay).await;
        entries
    }
}
