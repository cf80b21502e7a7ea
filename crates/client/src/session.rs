//! One multiplexed connection to a server.

use crate::callback::{RequestStatusCallback, Response, deliver};
use crate::config::{Network, SessionConfig};
use crate::error::{ClientError, Result};
use crate::transport::{FrameSink, FrameStream, dial};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tether_coder::{Coder, decode_value, encode_value};
use tether_packet::{
    HeaderBag, OPERATOR_HEARTBEAT, OPERATOR_REGISTER_LISTENER, OPERATOR_REMOVE_LISTENER,
    PROPERTY_CONTENT_TYPE, Packet, correlation_key, operator,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, trace, warn};

/// Status sent to handlers still waiting when the session closes.
const STATUS_SERVICE_UNAVAILABLE: i32 = 503;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    /// Dialing.
    Connecting = 0,
    /// Ready for requests.
    Open = 1,
    /// Close requested, tasks winding down.
    Closing = 2,
    /// Closed or never opened.
    Closed = 3,
}

impl ReadyState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

type ListenerFn = Arc<dyn Fn(Response) + Send + Sync>;

enum Pending {
    /// Answers exactly one request.
    Once(Box<dyn FnOnce(Response) + Send + Sync>),
    /// Receives every message pushed for a topic.
    Listener(ListenerFn),
}

struct Inner {
    address: String,
    network: Network,
    config: SessionConfig,
    coder: Arc<dyn Coder>,
    outbound: mpsc::Sender<Bytes>,
    pending: DashMap<i64, Pending>,
    headers: Mutex<HeaderBag>,
    state: AtomicU8,
    last_sequence: AtomicI64,
    /// Write error that ended the session, reported when it closes.
    failure: Mutex<Option<ClientError>>,
    cancel: CancellationToken,
}

/// A connection to one server carrying many concurrent requests.
///
/// Requests are matched to responses by `operator + sequence`, so any number
/// may be in flight at once. Cloning is cheap and every clone shares the
/// connection. The connection stays open until [`Session::close`] is called,
/// the server goes away, or the last clone is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
    // Background tasks only hold `Inner`; the last handle out closes.
    _guard: Arc<DropGuard>,
}

impl Session {
    /// Dial `address` over `network`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] if the server cannot be reached within
    /// the dial timeout, or a coder error if the content type is unknown.
    #[instrument(skip(config))]
    pub async fn connect(network: Network, address: &str, config: SessionConfig) -> Result<Self> {
        let coder = config.coders.get(&config.content_type)?;
        let (sink, frames) = dial(&network, address, &config).await?;

        let session = Self::start(address, network, config, coder, sink, frames);
        info!("Session connected to {} over {:?}", address, session.inner.network);
        Ok(session)
    }

    fn start(
        address: &str,
        network: Network,
        config: SessionConfig,
        coder: Arc<dyn Coder>,
        sink: FrameSink,
        frames: FrameStream,
    ) -> Self {
        let (outbound, queue) = mpsc::channel(config.send_queue_size.max(1));
        let cancel = CancellationToken::new();
        let inner = Arc::new(Inner {
            address: address.to_string(),
            network,
            config,
            coder,
            outbound,
            pending: DashMap::new(),
            headers: Mutex::new(HeaderBag::new()),
            state: AtomicU8::new(ReadyState::Open as u8),
            last_sequence: AtomicI64::new(0),
            failure: Mutex::new(None),
            cancel: cancel.clone(),
        });

        tokio::spawn(write_loop(sink, queue, Arc::clone(&inner)));
        tokio::spawn(Arc::clone(&inner).read_loop(frames));

        if let Some(hook) = &inner.config.on_open {
            hook(address);
        }
        Self {
            inner,
            _guard: Arc::new(cancel.drop_guard()),
        }
    }

    /// Address the session dialed.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Transport of the session.
    #[must_use]
    pub fn network(&self) -> &Network {
        &self.inner.network
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.inner.ready_state()
    }

    /// Returns `true` while requests can be sent.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Content type of request bodies.
    #[must_use]
    pub fn content_type(&self) -> &str {
        self.inner.coder.content_type()
    }

    /// Set a property sent with every later request.
    pub fn set_request_property(&self, key: &str, value: &str) {
        self.inner.headers.lock().set(key, value);
    }

    /// Read a session-wide request property.
    #[must_use]
    pub fn request_property(&self, key: &str) -> Option<String> {
        self.inner.headers.lock().get(key).map(str::to_string)
    }

    /// Stop sending a session-wide request property.
    pub fn remove_request_property(&self, key: &str) {
        self.inner.headers.lock().remove(key);
    }

    /// Number of requests and listeners awaiting packets.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Send a request and wait for its response.
    ///
    /// `callback` sees `on_start`, then `on_success` or `on_error`, then
    /// `on_end`, all before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] if no response arrives within
    /// `timeout`, or an error if the session is closed or the parameter cannot
    /// be encoded. An error response is reported to the callback, not here.
    pub async fn sync_send<T, C>(
        &self,
        route: &str,
        param: &T,
        timeout: Duration,
        callback: &C,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
        C: RequestStatusCallback + ?Sized,
    {
        let body = self.encode(param)?;
        callback.on_start();
        match self.inner.request(operator(route), body, timeout).await {
            Ok(response) => {
                deliver(callback, &response);
                Ok(())
            }
            Err(e) => {
                callback.on_end();
                Err(e)
            }
        }
    }

    /// Send a request and decode its response.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Remote`] for an error response,
    /// [`ClientError::Timeout`] if none arrives within `timeout`, or a coder
    /// error if either body does not convert.
    pub async fn call<T, R>(&self, route: &str, param: &T, timeout: Duration) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = self.encode(param)?;
        let response = self
            .inner
            .request(operator(route), body, timeout)
            .await?
            .into_result()?;
        Ok(decode_value(self.inner.coder.as_ref(), &response.body)?)
    }

    /// Send a request without waiting; `callback` runs when the response
    /// arrives.
    ///
    /// # Errors
    ///
    /// Fails if the session is closed or the parameter cannot be encoded.
    pub async fn async_send<T, C>(&self, route: &str, param: &T, callback: C) -> Result<()>
    where
        T: Serialize + ?Sized,
        C: RequestStatusCallback,
    {
        let body = self.encode(param)?;
        callback.on_start();

        let operator = operator(route);
        let callback = Arc::new(callback);
        let on_response = Arc::clone(&callback);
        let registered = self.inner.register(
            operator,
            Pending::Once(Box::new(move |response: Response| {
                deliver(on_response.as_ref(), &response);
            })),
        );
        let (sequence, key) = match registered {
            Ok(registered) => registered,
            Err(e) => {
                callback.on_end();
                return Err(e);
            }
        };

        if let Err(e) = self.inner.enqueue(operator, sequence, body).await {
            // A close may already have answered the callback.
            if self.inner.pending.remove(&key).is_some() {
                callback.on_end();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Send one heartbeat and wait for the reply.
    ///
    /// # Errors
    ///
    /// Fails if the reply does not arrive within `timeout` or is an error.
    pub async fn ping(&self, payload: impl Into<Bytes>, timeout: Duration) -> Result<()> {
        self.inner.ping(payload.into(), timeout).await
    }

    /// Send heartbeats every `interval` until the session closes.
    ///
    /// The first heartbeat goes out immediately. Each waits at most
    /// `interval` for its reply. The loop does not keep the session open.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn start_ping(&self, interval: Duration, payload: Bytes) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = inner.ping(payload.clone(), interval).await {
                    if !inner.is_open() {
                        break;
                    }
                    warn!("Heartbeat to {} failed: {}", inner.address, e);
                }
            }
            trace!("Heartbeat loop for {} stopped", inner.address);
        })
    }

    /// Subscribe to `topic`; `handler` receives every message pushed for it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Remote`] if the server refuses the subscription
    /// or [`ClientError::Timeout`] if it does not answer within `timeout`.
    pub async fn add_message_listener<F>(
        &self,
        topic: &str,
        timeout: Duration,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Response) + Send + Sync + 'static,
    {
        // Installed first so a message pushed before the acknowledgement is
        // not lost.
        let key = listener_key(topic);
        let previous = self
            .inner
            .pending
            .insert(key, Pending::Listener(Arc::new(handler)));

        let result = self
            .inner
            .request(OPERATOR_REGISTER_LISTENER, Bytes::copy_from_slice(topic.as_bytes()), timeout)
            .await
            .and_then(Response::into_result);

        if let Err(e) = result {
            match previous {
                Some(previous) => {
                    self.inner.pending.insert(key, previous);
                }
                None => {
                    self.inner.pending.remove(&key);
                }
            }
            return Err(e);
        }
        debug!("Listening on {} at {}", topic, self.inner.address);
        Ok(())
    }

    /// Unsubscribe from `topic` and drop its handler.
    ///
    /// # Errors
    ///
    /// Fails if the server does not confirm within `timeout`. The local
    /// handler is removed either way.
    pub async fn remove_message_listener(&self, topic: &str, timeout: Duration) -> Result<()> {
        self.inner.pending.remove(&listener_key(topic));
        self.inner
            .request(OPERATOR_REMOVE_LISTENER, Bytes::copy_from_slice(topic.as_bytes()), timeout)
            .await?
            .into_result()?;
        Ok(())
    }

    /// Close the connection. Requests still waiting fail with status 503.
    pub fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                ReadyState::Open as u8,
                ReadyState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            debug!("Closing session to {}", self.inner.address);
        }
        self.inner.cancel.cancel();
    }

    /// Wait until the session has closed.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await;
    }

    fn encode<T: Serialize + ?Sized>(&self, param: &T) -> Result<Bytes> {
        Ok(Bytes::from(encode_value(self.inner.coder.as_ref(), param)?))
    }
}

impl Inner {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    fn set_state(&self, state: ReadyState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Next sequence: wall-clock nanoseconds, strictly increasing per session.
    fn next_sequence(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX));

        let mut last = self.last_sequence.load(Ordering::Relaxed);
        loop {
            let next = now.max(last.wrapping_add(1));
            match self.last_sequence.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Reserve a correlation key for `operator`, drawing new sequences until
    /// one is free.
    fn register(&self, operator: u32, pending: Pending) -> Result<(i64, i64)> {
        if !self.is_open() {
            return Err(ClientError::Closed);
        }
        let (sequence, key) = loop {
            let sequence = self.next_sequence();
            let key = correlation_key(operator, sequence);
            if let Entry::Vacant(slot) = self.pending.entry(key) {
                slot.insert(pending);
                break (sequence, key);
            }
        };

        // Shutdown marks the state before draining, so an entry that landed
        // after the drain is still ours to take back.
        if !self.is_open() && self.pending.remove(&key).is_some() {
            return Err(ClientError::Closed);
        }
        Ok((sequence, key))
    }

    async fn enqueue(&self, operator: u32, sequence: i64, body: Bytes) -> Result<()> {
        let mut header = self.headers.lock().clone();
        header.set(PROPERTY_CONTENT_TYPE, self.coder.content_type());

        let packet = Packet::new(operator, sequence, header.to_bytes(), body);
        let packet = self.config.plugins.seal(packet)?;
        let frame = packet.encode(self.config.max_payload)?;

        tokio::select! {
            () = self.cancel.cancelled() => Err(ClientError::Closed),
            sent = self.outbound.send(frame) => sent.map_err(|_| ClientError::Closed),
        }
    }

    async fn request(&self, operator: u32, body: Bytes, timeout: Duration) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        let (sequence, key) = self.register(
            operator,
            Pending::Once(Box::new(move |response: Response| {
                let _ = tx.send(response);
            })),
        )?;

        if let Err(e) = self.enqueue(operator, sequence, body).await {
            self.pending.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.remove(&key);
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    async fn ping(&self, payload: Bytes, timeout: Duration) -> Result<()> {
        self.request(OPERATOR_HEARTBEAT, payload, timeout)
            .await?
            .into_result()?;
        Ok(())
    }

    /// Record why the connection broke and begin closing.
    fn fail(&self, err: ClientError) {
        debug!("Session to {} broke: {}", self.address, err);
        self.failure.lock().get_or_insert(err);
        self.cancel.cancel();
    }

    async fn read_loop(self: Arc<Self>, mut frames: FrameStream) {
        let outcome = loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => break Ok(()),
                next = frames.next() => next,
            };
            let packet = match next {
                Some(Ok(packet)) => packet,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };
            match self.config.plugins.open(packet) {
                Ok(packet) => self.route(Response::from_packet(packet)),
                Err(e) => break Err(ClientError::Packet(e)),
            }
        };

        self.shutdown(outcome);
    }

    fn route(&self, response: Response) {
        let key = correlation_key(response.operator, response.sequence);

        if let Some((_, Pending::Once(handler))) = self
            .pending
            .remove_if(&key, |_, pending| matches!(pending, Pending::Once(_)))
        {
            handler(response);
            return;
        }

        let listener = self.pending.get(&key).and_then(|pending| match &*pending {
            Pending::Listener(handler) => Some(Arc::clone(handler)),
            Pending::Once(_) => None,
        });
        match listener {
            Some(handler) => handler(response),
            None => trace!(
                "Dropped unmatched packet operator {} sequence {}",
                response.operator,
                response.sequence
            ),
        }
    }

    fn shutdown(&self, outcome: Result<()>) {
        self.set_state(ReadyState::Closed);
        self.cancel.cancel();

        let failure = self.failure.lock().take();
        let outcome = match (outcome, failure) {
            (Ok(()), Some(e)) => Err(e),
            (outcome, _) => outcome,
        };
        if let Err(e) = &outcome {
            warn!("Session to {} failed: {}", self.address, e);
            if let Some(hook) = &self.config.on_error {
                hook(e);
            }
        }

        let keys: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, Pending::Once(handler))) = self.pending.remove(&key) {
                handler(Response::failed(
                    0,
                    0,
                    STATUS_SERVICE_UNAVAILABLE,
                    "connection closed",
                ));
            }
        }

        debug!("Session to {} closed", self.address);
        if let Some(hook) = &self.config.on_close {
            hook(&self.address);
        }
    }
}

fn listener_key(topic: &str) -> i64 {
    i64::from(operator(topic))
}

async fn write_loop(mut sink: FrameSink, mut queue: mpsc::Receiver<Bytes>, inner: Arc<Inner>) {
    loop {
        let frame = tokio::select! {
            () = inner.cancel.cancelled() => break,
            frame = queue.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(e) = sink.send(frame).await {
            inner.fail(e);
            break;
        }
    }
    inner.cancel.cancel();
    if let Err(e) = sink.close().await {
        trace!("Session sink close failed: {}", e);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.inner.address)
            .field("network", &self.inner.network)
            .field("state", &self.ready_state())
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}
