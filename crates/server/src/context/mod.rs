//! Per-packet request handle.

mod outbound;

pub use outbound::{DatagramOutbound, MessageOutbound, Outbound, StreamOutbound, Transport};

use crate::error::{Fault, ServerError};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tether_broker::{Broker, Callback};
use tether_coder::{Coder, CoderRegistry, decode_value, encode_value};
use tether_packet::{
    HeaderBag, PROPERTY_CODE, PROPERTY_CONTENT_TYPE, PROPERTY_MESSAGE, Packet, PluginChain,
    operator,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Outcome of a handler or of [`Context::success`] / [`Context::error`].
///
/// Handlers finish with `return ctx.success(&value).await;`. Once a context
/// has responded, later responses are rejected with [`Fault::AlreadyResponded`].
pub type HandlerResult = Result<(), Fault>;

/// Endpoint-wide state every context needs.
pub(crate) struct Shared {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) coders: CoderRegistry,
    pub(crate) plugins: PluginChain,
    pub(crate) max_payload: usize,
    pub(crate) content_type: String,
}

impl Shared {
    /// Seal and frame a packet for the wire.
    pub(crate) fn frame(&self, packet: Packet) -> Result<Bytes, Fault> {
        let packet = self.plugins.seal(packet)?;
        Ok(packet.encode(self.max_payload)?)
    }
}

struct Inner {
    operator: u32,
    sequence: i64,
    body: Bytes,
    node_id: Arc<str>,
    outbound: Arc<dyn Outbound>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    request_header: Mutex<HeaderBag>,
    response_header: Mutex<HeaderBag>,
    content_type: Mutex<String>,
    values: Mutex<HashMap<String, String>>,
    completed: AtomicBool,
}

/// A request bound to the packet that carried it and the connection it
/// arrived on.
///
/// Cloning is cheap; every clone refers to the same request.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    pub(crate) fn new(
        shared: Arc<Shared>,
        outbound: Arc<dyn Outbound>,
        node_id: Arc<str>,
        cancel: CancellationToken,
        packet: Packet,
    ) -> Self {
        let request_header = HeaderBag::from_bytes(&packet.header);
        let content_type = request_header
            .get(PROPERTY_CONTENT_TYPE)
            .filter(|requested| shared.coders.contains(requested))
            .unwrap_or(shared.content_type.as_str())
            .to_string();

        Self {
            inner: Arc::new(Inner {
                operator: packet.operator,
                sequence: packet.sequence,
                body: packet.body,
                node_id,
                outbound,
                shared,
                cancel,
                request_header: Mutex::new(request_header),
                response_header: Mutex::new(HeaderBag::new()),
                content_type: Mutex::new(content_type),
                values: Mutex::new(HashMap::new()),
                completed: AtomicBool::new(false),
            }),
        }
    }

    /// Route identifier of the request.
    #[must_use]
    pub fn operator(&self) -> u32 {
        self.inner.operator
    }

    /// Sequence chosen by the client.
    #[must_use]
    pub fn sequence(&self) -> i64 {
        self.inner.sequence
    }

    /// Raw request body.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.inner.body
    }

    /// Identity of the connection within the broker.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Remote address of the peer.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.outbound.peer_addr()
    }

    /// Transport the request arrived on.
    #[must_use]
    pub fn transport(&self) -> Transport {
        self.inner.outbound.transport()
    }

    /// Broker shared by the server.
    #[must_use]
    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.inner.shared.broker)
    }

    /// Content type used for the request and response bodies.
    #[must_use]
    pub fn content_type(&self) -> String {
        self.inner.content_type.lock().clone()
    }

    /// Switch the body coder for the rest of this request.
    ///
    /// # Errors
    ///
    /// Fails if no coder is registered under `content_type`.
    pub fn set_content_type(&self, content_type: &str) -> Result<(), Fault> {
        self.inner.shared.coders.get(content_type)?;
        *self.inner.content_type.lock() = content_type.to_string();
        Ok(())
    }

    /// Read a request header property.
    #[must_use]
    pub fn request_property(&self, key: &str) -> Option<String> {
        self.inner.request_header.lock().get(key).map(str::to_string)
    }

    /// Set a request header property.
    pub fn set_request_property(&self, key: &str, value: &str) {
        self.inner.request_header.lock().set(key, value);
    }

    /// Read a response header property.
    #[must_use]
    pub fn response_property(&self, key: &str) -> Option<String> {
        self.inner.response_header.lock().get(key).map(str::to_string)
    }

    /// Set a response header property.
    pub fn set_response_property(&self, key: &str, value: &str) {
        self.inner.response_header.lock().set(key, value);
    }

    /// Read a request-scoped value.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<String> {
        self.inner.values.lock().get(key).cloned()
    }

    /// Store a request-scoped value.
    pub fn set_value(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.values.lock().insert(key.into(), value.into());
    }

    /// Store a request-scoped value and hand the context on, for middleware.
    #[must_use]
    pub fn with_value(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_value(key, value);
        self
    }

    /// Returns `true` once the connection carrying this request has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Returns `true` once a response has been written.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    fn coder(&self) -> Result<Arc<dyn Coder>, Fault> {
        Ok(self.inner.shared.coders.get(&self.content_type())?)
    }

    /// Decode the request body.
    ///
    /// # Errors
    ///
    /// Returns [`Fault::Param`] if the body does not decode into `T`.
    pub fn parse_param<T: DeserializeOwned>(&self) -> Result<T, Fault> {
        let coder = self.coder()?;
        decode_value(coder.as_ref(), &self.inner.body).map_err(Fault::Param)
    }

    /// Respond with an encoded value.
    ///
    /// # Errors
    ///
    /// Fails if the value cannot be encoded, the request already has a
    /// response, or the connection is gone.
    pub async fn success<T: Serialize + ?Sized>(&self, value: &T) -> HandlerResult {
        if self.is_completed() {
            return Err(Fault::AlreadyResponded);
        }
        let coder = self.coder()?;
        let body = encode_value(coder.as_ref(), value)?;
        self.respond(Bytes::from(body)).await
    }

    /// Respond with a body that is already encoded.
    ///
    /// # Errors
    ///
    /// Fails if the request already has a response or the connection is gone.
    pub async fn success_raw(&self, body: impl Into<Bytes>) -> HandlerResult {
        self.respond(body.into()).await
    }

    /// Respond with an error status and message and an empty body.
    ///
    /// `;` and `=` in the message are replaced since header values are not
    /// escaped.
    ///
    /// # Errors
    ///
    /// Fails if the request already has a response or the connection is gone.
    pub async fn error(&self, code: i32, message: &str) -> HandlerResult {
        if self.is_completed() {
            return Err(Fault::AlreadyResponded);
        }
        let message = message.replace(';', ",").replace('=', ":");
        {
            let mut header = self.inner.response_header.lock();
            header.set(PROPERTY_CODE, &code.to_string());
            header.set(PROPERTY_MESSAGE, &message);
        }
        self.respond(Bytes::new()).await
    }

    async fn respond(&self, body: Bytes) -> HandlerResult {
        if self.is_completed() {
            return Err(Fault::AlreadyResponded);
        }

        let header = self.inner.response_header.lock().to_bytes();
        let frame = self.inner.shared.frame(Packet::new(
            self.inner.operator,
            self.inner.sequence,
            header,
            body,
        ))?;

        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return Err(Fault::AlreadyResponded);
        }
        self.inner.outbound.send(frame).await?;
        Ok(())
    }

    /// Push an unsolicited, encoded message under `route`.
    ///
    /// # Errors
    ///
    /// Fails if the value cannot be encoded or the connection is gone.
    pub async fn write<T: Serialize + ?Sized>(&self, route: &str, value: &T) -> HandlerResult {
        let coder = self.coder()?;
        let body = encode_value(coder.as_ref(), value)?;
        self.write_raw(route, Bytes::from(body)).await
    }

    /// Push an unsolicited message under `route` with sequence 0.
    ///
    /// # Errors
    ///
    /// Fails if the frame is too large or the connection is gone.
    pub async fn write_raw(&self, route: &str, body: impl Into<Bytes>) -> HandlerResult {
        let frame = self.inner.shared.frame(Packet::new(
            operator(route),
            0,
            Bytes::new(),
            body.into(),
        ))?;
        self.inner.outbound.send(frame).await?;
        Ok(())
    }

    /// Register `callback` for `topic` under this connection's identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the subscription.
    /// Fails with [`ServerError::Closed`] once the connection has gone away;
    /// a subscription that raced the teardown is withdrawn again.
    pub async fn subscribe(&self, topic: &str, callback: Callback) -> HandlerResult {
        if self.is_closed() {
            return Err(ServerError::Closed.into());
        }

        let broker = &self.inner.shared.broker;
        broker
            .subscribe(&self.inner.node_id, topic, callback)
            .await?;

        // The connection may have been torn down while subscribing, after its
        // subscriptions were revoked.
        if self.is_closed() {
            debug!(
                "Withdrawing subscription to {} for closed connection {}",
                topic, self.inner.node_id
            );
            broker.unsubscribe(&self.inner.node_id, topic).await?;
            return Err(ServerError::Closed.into());
        }
        Ok(())
    }

    /// Subscribe this connection to `topic`, pushing every published message
    /// back to the peer under the topic's operator.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the subscription.
    pub async fn forward(&self, topic: &str) -> HandlerResult {
        let outbound = Arc::clone(&self.inner.outbound);
        let shared = Arc::clone(&self.inner.shared);
        let topic_operator = operator(topic);
        let topic_name: Arc<str> = Arc::from(topic);

        let callback = tether_broker::callback(move |message: Bytes| {
            let outbound = Arc::clone(&outbound);
            let shared = Arc::clone(&shared);
            let topic_name = Arc::clone(&topic_name);
            async move {
                let packet = Packet::new(topic_operator, 0, Bytes::new(), message);
                match shared.frame(packet) {
                    Ok(frame) => {
                        if let Err(e) = outbound.send(frame).await {
                            trace!("Dropped message on {} for closed peer: {}", topic_name, e);
                        }
                    }
                    Err(e) => warn!("Failed to frame message on {}: {}", topic_name, e),
                }
            }
        });

        self.subscribe(topic, callback).await
    }

    /// Drop this connection's subscription to `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker fails.
    pub async fn unsubscribe(&self, topic: &str) -> HandlerResult {
        self.inner
            .shared
            .broker
            .unsubscribe(&self.inner.node_id, topic)
            .await?;
        Ok(())
    }

    /// Drop every subscription held by this connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker fails.
    pub async fn unsubscribe_all(&self) -> HandlerResult {
        self.inner
            .shared
            .broker
            .unsubscribe_all(&self.inner.node_id)
            .await?;
        Ok(())
    }

    /// Publish an encoded value to `topic`.
    ///
    /// # Errors
    ///
    /// Fails if the value cannot be encoded or the broker fails.
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, value: &T) -> HandlerResult {
        let coder = self.coder()?;
        let body = encode_value(coder.as_ref(), value)?;
        self.publish_raw(topic, Bytes::from(body)).await
    }

    /// Publish raw bytes to `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker fails.
    pub async fn publish_raw(&self, topic: &str, message: impl Into<Bytes>) -> HandlerResult {
        self.inner
            .shared
            .broker
            .publish(topic, message.into())
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("operator", &self.inner.operator)
            .field("sequence", &self.inner.sequence)
            .field("node_id", &self.inner.node_id)
            .field("transport", &self.transport())
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}
