//! Durable-store trait describing the system of record.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::Entry;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Authoritative key-value storage shared by every node.
///
/// All operations succeed or fail independently of any node's cache.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Insert a new entry; an existing key yields [`RepoError::Duplicate`].
    async fn add(&self, entry: &Entry) -> Result<(), RepoError>;

    async fn try_get(&self, key: &str) -> Result<Option<String>, RepoError>;

    /// Overwrite the value of `entry.key`. Returns `false` when no row matched.
    async fn update(&self, entry: &Entry) -> Result<bool, RepoError>;

    /// Remove `key`. Returns `false` when no row matched.
    async fn delete(&self, key: &str) -> Result<bool, RepoError>;

    /// Every stored entry, used to warm a starting node.
    async fn list_all(&self) -> Result<Vec<Entry>, RepoError>;

    async fn health_check(&self) -> Result<(), RepoError> {
        Ok(())
    }
}
