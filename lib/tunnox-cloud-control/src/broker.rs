//! In-memory `Broker` (`tunnox_core::contracts::Broker`), the single-process
//! stand-in for whatever pub/sub a real deployment points the bridge adapter
//! (`tunnox-core::bridge`) at. Per spec §1/§4.8 non-goals this makes no
//! attempt at arbitrary fan-out guarantees or exactly-once delivery — a full
//! subscriber channel just drops the publish, same as the real thing would.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use tunnox_types::CoreError;

use tunnox_core::contracts::{Broker, InboundMessage};

/// Bounded per the bridge adapter's own ready-message backlog (spec §4.8).
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

pub struct InMemoryBroker {
    node_id: String,
    topics: DashMap<String, Vec<mpsc::Sender<InboundMessage>>>,
}

impl InMemoryBroker {
    pub fn new(node_id: impl Into<String>) -> Self {
        InMemoryBroker {
            node_id: node_id.into(),
            topics: DashMap::new(),
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), CoreError> {
        let Some(mut senders) = self.topics.get_mut(topic) else {
            return Ok(());
        };

        let message = InboundMessage {
            topic: topic.to_string(),
            payload,
            source_node_id: self.node_id.clone(),
            published_at_unix: tunnox_common::time::timestamp_secs(),
        };

        senders.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(topic, "subscriber channel full, dropping publish for it");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<InboundMessage>, CoreError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.topics.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }

    /// A single process keeps no identity for "this particular subscriber"
    /// beyond the channel itself — dropping the `Receiver` returned by
    /// `subscribe` already stops delivery to it (the next `publish` prunes
    /// the dead sender). This is therefore a no-op for the in-memory
    /// reference broker.
    async fn unsubscribe(&self, _topic: &str) -> Result<(), CoreError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_a_subscriber() {
        let broker = InMemoryBroker::new("node-a");
        let mut rx = broker.subscribe("tunnox.tunnel_ready").await.unwrap();

        broker.publish("tunnox.tunnel_ready", b"payload".to_vec()).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, b"payload");
        assert_eq!(msg.source_node_id, "node-a");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_noop() {
        let broker = InMemoryBroker::new("node-a");
        broker.publish("nobody-listening", b"x".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn multiple_subscribers_on_the_same_topic_each_receive_it() {
        let broker = InMemoryBroker::new("node-a");
        let mut a = broker.subscribe("topic").await.unwrap();
        let mut b = broker.subscribe("topic").await.unwrap();

        broker.publish("topic", b"hi".to_vec()).await.unwrap();

        assert_eq!(a.recv().await.unwrap().payload, b"hi");
        assert_eq!(b.recv().await.unwrap().payload, b"hi");
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let broker = InMemoryBroker::new("node-a");
        {
            let _rx = broker.subscribe("topic").await.unwrap();
        }
        broker.publish("topic", b"first".to_vec()).await.unwrap();
        assert!(broker.topics.get("topic").unwrap().is_empty());
    }
}
