//! NATS-backed broker for tether.
//!
//! Every topic maps to the subject `{prefix}.{topic}`, so servers that share a
//! NATS cluster and a prefix see each other's publishes.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;
use std::fmt;

use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tether_broker::{Broker, BrokerError, Callback};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Subject prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "tether";

/// Builds the NATS subject for a topic.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidTopic`] when the topic is empty or holds a
/// subject separator, a wildcard or whitespace.
pub fn subject(prefix: &str, topic: &str) -> Result<String, BrokerError> {
    if topic.is_empty()
        || topic
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
    {
        return Err(BrokerError::InvalidTopic(topic.to_string()));
    }

    Ok(format!("{prefix}.{topic}"))
}

struct Subscription {
    // Dropping the sender stops the forwarding task.
    _stop_sender: watch::Sender<()>,
}

impl Subscription {
    fn spawn(mut subscriber: async_nats::Subscriber, subject: String, callback: Callback) -> Self {
        let (stop_sender, mut stop_receiver) = watch::channel(());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_receiver.changed() => break,
                    message = subscriber.next() => match message {
                        Some(message) => callback(message.payload).await,
                        None => break,
                    },
                }
            }
            trace!("Subscription to {} stopped", subject);
        });

        Self {
            _stop_sender: stop_sender,
        }
    }
}

/// Broker that relays topics through a NATS server.
pub struct NatsBroker {
    client: Client,
    prefix: String,
    nodes: DashMap<String, HashMap<String, Subscription>>,
}

impl fmt::Debug for NatsBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsBroker")
            .field("prefix", &self.prefix)
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

impl NatsBroker {
    /// Wraps an existing NATS client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
            nodes: DashMap::new(),
        }
    }

    /// Connects to the NATS server at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Backend`] when the connection fails.
    pub async fn connect(address: &str) -> Result<Self, BrokerError> {
        let client = async_nats::connect(address)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        Ok(Self::new(client))
    }

    /// Sets the subject prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// The subject prefix in use.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of live subscriptions held by `node_id` on this broker.
    #[must_use]
    pub fn subscription_count(&self, node_id: &str) -> usize {
        self.nodes.get(node_id).map_or(0, |topics| topics.len())
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, topic: &str, message: Bytes) -> Result<(), BrokerError> {
        let subject = subject(&self.prefix, topic)?;
        self.client
            .publish(subject, message)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))
    }

    async fn subscribe(
        &self,
        node_id: &str,
        topic: &str,
        callback: Callback,
    ) -> Result<(), BrokerError> {
        let subject = subject(&self.prefix, topic)?;
        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;
        // Make sure the server knows about the interest before returning.
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))?;

        debug!("Node {} subscribed to {}", node_id, subject);
        let subscription = Subscription::spawn(subscriber, subject, callback);
        self.nodes
            .entry(node_id.to_string())
            .or_default()
            .insert(topic.to_string(), subscription);
        Ok(())
    }

    async fn unsubscribe(&self, node_id: &str, topic: &str) -> Result<(), BrokerError> {
        if let Some(mut topics) = self.nodes.get_mut(node_id) {
            topics.remove(topic);
        }
        self.nodes.remove_if(node_id, |_, topics| topics.is_empty());
        Ok(())
    }

    async fn unsubscribe_all(&self, node_id: &str) -> Result<(), BrokerError> {
        if let Some((_, topics)) = self.nodes.remove(node_id) {
            debug!("Dropped {} subscriptions of node {}", topics.len(), node_id);
        }
        Ok(())
    }
}

// Re-export dependencies that are part of our public API
pub use async_nats;
