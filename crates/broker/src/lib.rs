//! Abstract interface for fanning topic messages out to connections.
//!
//! Every subscription is owned by a node, the identity of one connection. When
//! a connection goes away its node is unsubscribed from everything at once.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;

/// Invoked once for every message published to a subscribed topic.
pub type Callback = Arc<dyn Fn(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`Callback`].
pub fn callback<F, Fut>(f: F) -> Callback
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Errors raised by a broker.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The broker has been shut down.
    #[error("broker is closed")]
    Closed,

    /// The backing service failed.
    #[error("broker backend error: {0}")]
    Backend(String),

    /// The topic cannot be expressed in the backend's naming scheme.
    #[error("invalid topic {0:?}")]
    InvalidTopic(String),
}

/// A publish/subscribe broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Deliver `message` to every subscriber of `topic`.
    async fn publish(&self, topic: &str, message: Bytes) -> Result<(), BrokerError>;

    /// Register `callback` for `topic` on behalf of `node_id`.
    ///
    /// A node holds at most one subscription per topic; subscribing again
    /// replaces the earlier callback.
    async fn subscribe(
        &self,
        node_id: &str,
        topic: &str,
        callback: Callback,
    ) -> Result<(), BrokerError>;

    /// Drop the subscription of `node_id` for `topic`.
    async fn unsubscribe(&self, node_id: &str, topic: &str) -> Result<(), BrokerError>;

    /// Drop every subscription held by `node_id`.
    async fn unsubscribe_all(&self, node_id: &str) -> Result<(), BrokerError>;
}
