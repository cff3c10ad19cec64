//! Postgres LISTEN/NOTIFY bus.
//!
//! Each kind has its own channel; the payload is the JSON-encoded message.
//! Postgres drops notifications for sessions that are not listening, so a
//! dropped listener connection is surfaced as a [`Delivery::Gap`].

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgListener, PgPool};
use tracing::{info, warn};

use crate::{
    application::bus::{BusError, Delivery, DeliveryStream, InvalidationBus},
    domain::messages::{InvalidationKind, InvalidationMessage},
};

pub const CHANNEL_KEY_MODIFIED: &str = "kvs_key_modified";
pub const CHANNEL_KEY_DELETED: &str = "kvs_key_deleted";

pub fn channel_for(kind: InvalidationKind) -> &'static str {
    match kind {
        InvalidationKind::Modified => CHANNEL_KEY_MODIFIED,
        InvalidationKind::Deleted => CHANNEL_KEY_DELETED,
    }
}

#[derive(Clone)]
pub struct PostgresInvalidationBus {
    pool: PgPool,
}

impl PostgresInvalidationBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvalidationBus for PostgresInvalidationBus {
    async fn publish(&self, message: &InvalidationMessage) -> Result<(), BusError> {
        let payload = serde_json::to_string(message)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel_for(message.kind))
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(BusError::transport)?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<DeliveryStream, BusError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(BusError::transport)?;
        let channels = InvalidationKind::ALL.map(channel_for);
        listener
            .listen_all(channels)
            .await
            .map_err(BusError::transport)?;
        info!(?channels, "listening for invalidations");

        let deliveries = stream! {
            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        if let Some(message) = decode(notification.channel(), notification.payload()) {
                            yield Ok::<_, BusError>(Delivery::Message(message));
                        }
                    }
                    // The listener reconnects on the next call.
                    Ok(None) => yield Ok(Delivery::Gap { missed: None }),
                    Err(err) => {
                        yield Err(BusError::transport(err));
                        break;
                    }
                }
            }
        };
        Ok(deliveries.boxed())
    }
}

fn decode(channel: &str, payload: &str) -> Option<InvalidationMessage> {
    let message: InvalidationMessage = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(err) => {
            warn!(channel, error = %err, "discarding malformed invalidation payload");
            return None;
        }
    };
    if channel_for(message.kind) != channel {
        warn!(
            channel,
            kind = message.kind.as_str(),
            "discarding invalidation received on the wrong channel"
        );
        return None;
    }
    Some(message)
}
