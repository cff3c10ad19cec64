//! In-process bus over a tokio broadcast channel.

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
    application::bus::{BusError, Delivery, DeliveryStream, InvalidationBus},
    domain::messages::InvalidationMessage,
};

/// Fans every published message out to all current subscribers.
///
/// A subscriber that falls more than `capacity` messages behind receives a
/// [`Delivery::Gap`] instead of the overwritten messages.
#[derive(Debug, Clone)]
pub struct MemoryInvalidationBus {
    sender: broadcast::Sender<InvalidationMessage>,
}

impl MemoryInvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

#[async_trait]
impl InvalidationBus for MemoryInvalidationBus {
    async fn publish(&self, message: &InvalidationMessage) -> Result<(), BusError> {
        // No subscribers simply means nobody holds a cache to invalidate.
        let _ = self.sender.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<DeliveryStream, BusError> {
        let mut receiver = self.sender.subscribe();
        let deliveries = stream! {
            loop {
                match receiver.recv().await {
                    Ok(message) => yield Ok::<_, BusError>(Delivery::Message(message)),
                    Err(RecvError::Lagged(missed)) => yield Ok(Delivery::Gap { missed: Some(missed) }),
                    Err(RecvError::Closed) => break,
                }
            }
        };
        Ok(deliveries.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::NodeId;

    #[tokio::test]
    async fn every_subscriber_receives_each_message() {
        let bus = MemoryInvalidationBus::new(8);
        let mut first = bus.subscribe().await.unwrap();
        let mut second = bus.subscribe().await.unwrap();
        let message = InvalidationMessage::modified(NodeId::generate(), "k");

        bus.publish(&message).await.unwrap();

        for stream in [&mut first, &mut second] {
            match stream.next().await {
                Some(Ok(Delivery::Message(received))) => assert_eq!(received, message),
                other => panic!("unexpected delivery: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = MemoryInvalidationBus::new(8);
        let message = InvalidationMessage::deleted(NodeId::generate(), "k");

        bus.publish(&message).await.unwrap();

        let mut stream = bus.subscribe().await.unwrap();
        bus.publish(&message).await.unwrap();
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Delivery::Message(message)
        );
    }

    #[tokio::test]
    async fn lagging_subscriber_sees_a_gap() {
        let bus = MemoryInvalidationBus::new(2);
        let mut stream = bus.subscribe().await.unwrap();
        let node = NodeId::generate();

        for i in 0..5 {
            bus.publish(&InvalidationMessage::modified(node, format!("k{i}")))
                .await
                .unwrap();
        }

        match stream.next().await {
            Some(Ok(Delivery::Gap { missed })) => assert_eq!(missed, Some(3)),
            other => panic!("unexpected delivery: {other:?}"),
        }
        match stream.next().await {
            Some(Ok(Delivery::Message(message))) => assert_eq!(message.key, "k3"),
            other => panic!("unexpected delivery: {other:?}"),
        }
    }
}
