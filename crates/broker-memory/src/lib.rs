//! In-memory implementation of the broker crate.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tether_broker::{Broker, BrokerError, Callback};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Default number of undelivered messages buffered per subscription.
pub const DEFAULT_QUEUE_SIZE: usize = 1000;

/// One node's registration for one topic.
///
/// Messages are queued and handed to the callback by a dedicated task, so a
/// slow subscriber never blocks the publisher and sees messages in order.
/// Dropping the subscription closes the queue and ends the task.
#[derive(Debug)]
struct Subscription {
    sender: mpsc::Sender<Bytes>,
}

impl Subscription {
    fn spawn(topic: String, callback: Callback, queue_size: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Bytes>(queue_size);

        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                callback(message).await;
            }
            trace!("Subscription worker for {} finished", topic);
        });

        Self { sender }
    }
}

/// Broker that fans out within the current process.
#[derive(Debug)]
pub struct MemoryBroker {
    nodes: DashMap<String, HashMap<String, Subscription>>,
    queue_size: usize,
}

impl MemoryBroker {
    /// Create a broker with the default queue size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_size(DEFAULT_QUEUE_SIZE)
    }

    /// Create a broker buffering up to `queue_size` messages per subscriber.
    #[must_use]
    pub fn with_queue_size(queue_size: usize) -> Self {
        Self {
            nodes: DashMap::new(),
            queue_size: queue_size.max(1),
        }
    }

    /// Number of nodes subscribed to `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.contains_key(topic))
            .count()
    }

    /// Number of nodes holding at least one subscription.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, message: Bytes) -> Result<(), BrokerError> {
        // Collect first so no shard lock is held while sending.
        let senders: Vec<(String, mpsc::Sender<Bytes>)> = self
            .nodes
            .iter()
            .filter_map(|node| {
                node.get(topic)
                    .map(|subscription| (node.key().clone(), subscription.sender.clone()))
            })
            .collect();

        trace!("Publishing to {} subscribers of {}", senders.len(), topic);

        for (node_id, sender) in senders {
            match sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Subscriber {} is lagging, dropped message on {}", node_id, topic);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Subscriber {} went away while publishing on {}", node_id, topic);
                }
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        node_id: &str,
        topic: &str,
        callback: Callback,
    ) -> Result<(), BrokerError> {
        let subscription = Subscription::spawn(topic.to_string(), callback, self.queue_size);
        self.nodes
            .entry(node_id.to_string())
            .or_default()
            .insert(topic.to_string(), subscription);

        debug!("Node {} subscribed to {}", node_id, topic);
        Ok(())
    }

    async fn unsubscribe(&self, node_id: &str, topic: &str) -> Result<(), BrokerError> {
        let now_empty = self.nodes.get_mut(node_id).is_some_and(|mut topics| {
            topics.remove(topic);
            topics.is_empty()
        });
        if now_empty {
            self.nodes.remove_if(node_id, |_, topics| topics.is_empty());
        }

        debug!("Node {} unsubscribed from {}", node_id, topic);
        Ok(())
    }

    async fn unsubscribe_all(&self, node_id: &str) -> Result<(), BrokerError> {
        if let Some((_, topics)) = self.nodes.remove(node_id) {
            debug!("Node {} unsubscribed from {} topics", node_id, topics.len());
        }
        Ok(())
    }
}
