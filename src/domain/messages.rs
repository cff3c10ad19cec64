//! Invalidation messages exchanged between nodes.

use serde::{Deserialize, Serialize};

use super::entities::NodeId;

/// What happened to a key on the originating node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationKind {
    /// The key was created or its value changed.
    Modified,
    /// The key was removed.
    Deleted,
}

impl InvalidationKind {
    pub const ALL: [InvalidationKind; 2] = [InvalidationKind::Modified, InvalidationKind::Deleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationKind::Modified => "modified",
            InvalidationKind::Deleted => "deleted",
        }
    }
}

/// Notification that `key` changed on `origin_node`.
///
/// Carries no value: receivers only learn that their cached copy can no
/// longer be trusted and pull the authoritative value when it is next used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub origin_node: NodeId,
    pub key: String,
    pub kind: InvalidationKind,
}

impl InvalidationMessage {
    pub fn modified(origin_node: NodeId, key: impl Into<String>) -> Self {
        Self {
            origin_node,
            key: key.into(),
            kind: InvalidationKind::Modified,
        }
    }

    pub fn deleted(origin_node: NodeId, key: impl Into<String>) -> Self {
        Self {
            origin_node,
            key: key.into(),
            kind: InvalidationKind::Deleted,
        }
    }
}
