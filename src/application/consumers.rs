//! Inbound invalidation handling.
//!
//! Each node runs one [`InvalidationListener`] that drains its bus
//! subscription and hands every delivery to the consumers below. Consumers
//! never touch the durable store; they only set staleness markers.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::domain::messages::{InvalidationKind, InvalidationMessage};

use super::bus::{BusError, Delivery, DeliveryStream, InvalidationBus};
use super::repository::KeyValueRepository;

const METRIC_RECEIVED: &str = "kvs_invalidation_received_total";
const METRIC_IGNORED_OWN: &str = "kvs_invalidation_ignored_own_total";
const METRIC_GAP: &str = "kvs_delivery_gap_total";
const METRIC_RESUBSCRIBE: &str = "kvs_bus_resubscribe_total";

const MAX_RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(30);

/// What a consumer did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumed {
    Marked,
    /// Published by this node; its cache already reflects the change.
    IgnoredOwn,
}

/// Handles `Modified` notifications.
pub struct KeyModifiedConsumer {
    repository: Arc<KeyValueRepository>,
}

impl KeyModifiedConsumer {
    pub fn new(repository: Arc<KeyValueRepository>) -> Self {
        Self { repository }
    }

    pub async fn consume(&self, message: &InvalidationMessage) -> Consumed {
        if message.origin_node == self.repository.node_id() {
            counter!(METRIC_IGNORED_OWN, "kind" => InvalidationKind::Modified.as_str()).increment(1);
            return Consumed::IgnoredOwn;
        }
        self.repository.mark_modified(&message.key).await;
        Consumed::Marked
    }
}

/// Handles `Deleted` notifications.
pub struct KeyDeletedConsumer {
    repository: Arc<KeyValueRepository>,
}

impl KeyDeletedConsumer {
    pub fn new(repository: Arc<KeyValueRepository>) -> Self {
        Self { repository }
    }

    pub async fn consume(&self, message: &InvalidationMessage) -> Consumed {
        if message.origin_node == self.repository.node_id() {
            counter!(METRIC_IGNORED_OWN, "kind" => InvalidationKind::Deleted.as_str()).increment(1);
            return Consumed::IgnoredOwn;
        }
        self.repository.mark_deleted(&message.key).await;
        Consumed::Marked
    }
}

/// Routes deliveries to the consumer for their kind.
pub struct InvalidationDispatcher {
    repository: Arc<KeyValueRepository>,
    modified: KeyModifiedConsumer,
    deleted: KeyDeletedConsumer,
}

impl InvalidationDispatcher {
    pub fn new(repository: Arc<KeyValueRepository>) -> Self {
        Self {
            modified: KeyModifiedConsumer::new(Arc::clone(&repository)),
            deleted: KeyDeletedConsumer::new(Arc::clone(&repository)),
            repository,
        }
    }

    pub async fn dispatch(&self, delivery: Delivery) {
        match delivery {
            Delivery::Message(message) => {
                counter!(METRIC_RECEIVED, "kind" => message.kind.as_str()).increment(1);
                let consumed = match message.kind {
                    InvalidationKind::Modified => self.modified.consume(&message).await,
                    InvalidationKind::Deleted => self.deleted.consume(&message).await,
                };
                debug!(
                    key = %message.key,
                    kind = message.kind.as_str(),
                    origin_node = %message.origin_node,
                    ?consumed,
                    "invalidation consumed"
                );
            }
            Delivery::Gap { missed } => {
                counter!(METRIC_GAP).increment(1);
                warn!(?missed, "invalidations may have been lost, distrusting the whole cache");
                self.repository.mark_all_modified().await;
            }
        }
    }
}

/// Background task feeding bus deliveries to the dispatcher.
///
/// Each delivery is applied on its own task: a marker waits for the key's
/// lock, and a slow operation on one key must not hold back markers for
/// the others.
pub struct InvalidationListener {
    bus: Arc<dyn InvalidationBus>,
    dispatcher: Arc<InvalidationDispatcher>,
    resubscribe_backoff: Duration,
}

impl InvalidationListener {
    pub fn new(
        bus: Arc<dyn InvalidationBus>,
        repository: Arc<KeyValueRepository>,
        resubscribe_backoff: Duration,
    ) -> Self {
        Self {
            bus,
            dispatcher: Arc::new(InvalidationDispatcher::new(repository)),
            resubscribe_backoff,
        }
    }

    /// Subscribe, then drain the subscription on a spawned task.
    ///
    /// The subscription is live when this returns, so nothing published
    /// afterwards is missed.
    pub async fn start(self) -> Result<JoinHandle<()>, BusError> {
        let stream = self.bus.subscribe().await?;
        info!("invalidation listener subscribed");
        Ok(tokio::spawn(self.run(stream)))
    }

    async fn run(self, mut stream: DeliveryStream) {
        // Dropped with the listener task, which aborts in-flight dispatches.
        let mut in_flight = JoinSet::new();
        loop {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(delivery) => self.spawn_dispatch(&mut in_flight, delivery),
                    Err(err) => {
                        warn!(error = %err, "invalidation subscription failed");
                        break;
                    }
                }
            }

            stream = self.resubscribe().await;
            // Anything published while unsubscribed is unaccounted for.
            self.spawn_dispatch(&mut in_flight, Delivery::Gap { missed: None });
        }
    }

    fn spawn_dispatch(&self, in_flight: &mut JoinSet<()>, delivery: Delivery) {
        while let Some(finished) = in_flight.try_join_next() {
            if let Err(err) = finished {
                warn!(error = %err, "invalidation dispatch task failed");
            }
        }
        let dispatcher = Arc::clone(&self.dispatcher);
        in_flight.spawn(async move { dispatcher.dispatch(delivery).await });
    }

    async fn resubscribe(&self) -> DeliveryStream {
        let mut attempt: u32 = 0;
        loop {
            let backoff = self
                .resubscribe_backoff
                .saturating_mul(1 << attempt.min(8))
                .min(MAX_RESUBSCRIBE_BACKOFF);
            attempt = attempt.saturating_add(1);
            sleep(backoff).await;

            counter!(METRIC_RESUBSCRIBE).increment(1);
            match self.bus.subscribe().await {
                Ok(stream) => {
                    info!(attempt, "invalidation listener resubscribed");
                    return stream;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "resubscribe failed");
                }
            }
        }
    }
}
