//! Per-node in-memory cache with staleness markers.
//!
//! Values and markers live in two separate maps: a marker may exist for a key
//! this node has never cached (a remote node created it), and a cached value
//! without a marker is fresh.

use std::collections::HashMap;
use std::sync::RwLock;

use metrics::counter;
use thiserror::Error;

use crate::domain::entities::Entry;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";
const METRIC_CACHE_WARMED: &str = "kvs_cache_warmed_total";

/// Whether the locally cached copy of a key may still be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Staleness {
    /// No remote change has been observed since the key was last reconciled.
    #[default]
    Fresh,
    /// Another node changed the key; the cached value must be re-read.
    ModifiedRemotely,
    /// Another node removed the key; the cached value must be dropped.
    DeletedRemotely,
}

impl Staleness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Staleness::Fresh => "fresh",
            Staleness::ModifiedRemotely => "modified_remotely",
            Staleness::DeletedRemotely => "deleted_remotely",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("key `{0}` is already cached")]
    AlreadyPresent(String),
    #[error("key `{0}` is not cached")]
    Missing(String),
}

/// Unbounded key-value cache shared by every task of one node.
///
/// Each call takes the relevant lock for its own duration only; sequencing
/// several calls for one key is the caller's job (see [`super::KeyLocks`]).
#[derive(Debug, Default)]
pub struct CacheStore {
    values: RwLock<HashMap<String, String>>,
    markers: RwLock<HashMap<String, Staleness>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key that must not be cached yet.
    pub fn add(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut values = rw_write(&self.values, SOURCE, "add");
        if values.contains_key(key) {
            return Err(CacheError::AlreadyPresent(key.to_string()));
        }
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        rw_read(&self.values, SOURCE, "get").get(key).cloned()
    }

    /// Remove a key, returning whether it was cached.
    pub fn remove(&self, key: &str) -> bool {
        rw_write(&self.values, SOURCE, "remove")
            .remove(key)
            .is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        rw_read(&self.values, SOURCE, "contains").contains_key(key)
    }

    /// Insert or overwrite a key.
    pub fn set(&self, key: &str, value: &str) {
        rw_write(&self.values, SOURCE, "set").insert(key.to_string(), value.to_string());
    }

    /// Overwrite the value of a key that must already be cached.
    pub fn update(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut values = rw_write(&self.values, SOURCE, "update");
        match values.get_mut(key) {
            Some(slot) => {
                *slot = value.to_string();
                Ok(())
            }
            None => Err(CacheError::Missing(key.to_string())),
        }
    }

    /// Current marker for a key; unmarked keys are fresh.
    pub fn staleness(&self, key: &str) -> Staleness {
        rw_read(&self.markers, SOURCE, "staleness")
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// Set the marker for a key, replacing any previous one.
    pub fn mark(&self, key: &str, staleness: Staleness) {
        let mut markers = rw_write(&self.markers, SOURCE, "mark");
        match staleness {
            Staleness::Fresh => {
                markers.remove(key);
            }
            other => {
                markers.insert(key.to_string(), other);
            }
        }
    }

    pub fn clear_marker(&self, key: &str) {
        self.mark(key, Staleness::Fresh);
    }

    /// Keys currently holding a value.
    pub fn keys(&self) -> Vec<String> {
        rw_read(&self.values, SOURCE, "keys").keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.values, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bulk-load entries read from the durable store.
    ///
    /// Keys that already carry a marker are skipped: a notification arrived
    /// after the entries were read, so the loaded value may already be stale.
    pub fn warm(&self, entries: impl IntoIterator<Item = Entry>) -> usize {
        let markers = rw_read(&self.markers, SOURCE, "warm");
        let mut values = rw_write(&self.values, SOURCE, "warm");
        let mut loaded = 0;
        for entry in entries {
            if markers.contains_key(&entry.key) {
                continue;
            }
            values.insert(entry.key, entry.value);
            loaded += 1;
        }
        counter!(METRIC_CACHE_WARMED).increment(loaded as u64);
        loaded
    }
}
