//! Invalidation bus trait: a publish primitive and a delivery stream.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::domain::messages::InvalidationMessage;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("failed to encode invalidation message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("bus operation timed out")]
    Timeout,
    #[error("bus is closed")]
    Closed,
}

impl BusError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

/// One item of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message(InvalidationMessage),
    /// Notifications may have been lost (receiver lagged, connection
    /// re-established). `missed` is set when the transport knows how many.
    Gap { missed: Option<u64> },
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BusError>>;

/// Publish/subscribe channel fanning invalidations out to every node,
/// the publisher included.
///
/// Delivery is at-least-once and unordered; consumers must be idempotent.
/// A stream that ends or yields an error must be replaced by a fresh
/// subscription.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
    async fn publish(&self, message: &InvalidationMessage) -> Result<(), BusError>;

    async fn subscribe(&self) -> Result<DeliveryStream, BusError>;
}
