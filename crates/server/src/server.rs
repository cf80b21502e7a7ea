//! Server handle, builder and per-packet dispatch.

use crate::config::ServerConfig;
use crate::context::{Context, HandlerResult, Outbound, Shared, Transport};
use crate::error::{Fault, Result, STATUS_NOT_FOUND, ServerError, panic_message};
use crate::router::{Handler, Router};
use crate::transport::{tcp, udp, websocket};
use bytes::Bytes;
use futures::FutureExt;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tether_broker::Broker;
use tether_broker_memory::MemoryBroker;
use tether_coder::{CoderError, CoderRegistry};
use tether_packet::{
    OPERATOR_HEARTBEAT, OPERATOR_REGISTER_LISTENER, OPERATOR_REMOVE_LISTENER, Packet,
};
use tokio::net::{TcpListener, ToSocketAddrs, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Identity of one connection, passed to the open and close hooks.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Broker identity of the connection.
    pub node_id: Arc<str>,
    /// Remote address.
    pub peer_addr: SocketAddr,
    /// Transport kind.
    pub transport: Transport,
}

/// Called when a connection opens or closes.
pub type ConnectionHook = Arc<dyn Fn(&ConnectionInfo) + Send + Sync>;

/// Called with connection failures and handler panics.
pub type ErrorHook = Arc<dyn Fn(&ServerError) + Send + Sync>;

#[derive(Clone, Default)]
struct Hooks {
    on_open: Option<ConnectionHook>,
    on_close: Option<ConnectionHook>,
    on_error: Option<ErrorHook>,
}

pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) shutdown: CancellationToken,
    router: Router,
    shared: Arc<Shared>,
    hooks: Hooks,
    ping: Option<Arc<dyn Handler>>,
}

impl ServerInner {
    pub(crate) fn context(
        &self,
        outbound: Arc<dyn Outbound>,
        node_id: Arc<str>,
        cancel: &CancellationToken,
        packet: Packet,
    ) -> Context {
        Context::new(Arc::clone(&self.shared), outbound, node_id, cancel.clone(), packet)
    }

    /// Open an inbound packet with the configured plugins.
    pub(crate) fn open(&self, packet: Packet) -> Result<Packet> {
        Ok(self.config.plugins.open(packet)?)
    }

    /// Handle `ctx` on its own task, abandoned once its connection closes.
    pub(crate) fn spawn_dispatch(self: &Arc<Self>, ctx: Context) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = ctx.cancellation().clone();
            tokio::select! {
                biased;
                () = cancel.cancelled() => trace!("Dropped request {} on closed connection", ctx.sequence()),
                () = server.dispatch(ctx.clone()) => {}
            }
        });
    }

    async fn dispatch(&self, ctx: Context) {
        let outcome = AssertUnwindSafe(self.route(ctx.clone()))
            .catch_unwind()
            .await;

        let result = outcome.unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            error!(
                "Handler for operator {} panicked: {}",
                ctx.operator(),
                message
            );
            self.report(&ServerError::Panicked(message.clone()));
            Err(Fault::Panicked(message))
        });

        match result {
            Ok(()) if ctx.is_completed() => {}
            Ok(()) => {
                if let Err(e) = ctx.success_raw(Bytes::new()).await {
                    debug!("Failed to send default response: {}", e);
                }
            }
            Err(fault) if ctx.is_completed() => {
                debug!(
                    "Handler for operator {} failed after responding: {}",
                    ctx.operator(),
                    fault
                );
            }
            Err(fault) => {
                debug!("Handler for operator {} failed: {}", ctx.operator(), fault);
                if let Err(e) = ctx.error(fault.status(), &fault.to_string()).await {
                    debug!("Failed to send error response: {}", e);
                }
            }
        }
    }

    async fn route(&self, ctx: Context) -> HandlerResult {
        match ctx.operator() {
            OPERATOR_HEARTBEAT => match &self.ping {
                Some(handler) => handler.call(ctx).await,
                None => Ok(()),
            },
            OPERATOR_REGISTER_LISTENER => {
                let topic = topic(&ctx)?;
                if topic.is_empty() {
                    return Err(Fault::Param(CoderError::Decode(
                        "listener topic is empty".to_string(),
                    )));
                }
                ctx.forward(&topic).await
            }
            OPERATOR_REMOVE_LISTENER => {
                let topic = topic(&ctx)?;
                if topic.is_empty() {
                    ctx.unsubscribe_all().await
                } else {
                    ctx.unsubscribe(&topic).await
                }
            }
            _ => match self.router.dispatch(ctx.clone()).await {
                Some(result) => result,
                None => ctx.error(STATUS_NOT_FOUND, "route not found").await,
            },
        }
    }

    pub(crate) fn opened(&self, info: &ConnectionInfo) {
        debug!(
            "{} connection {} opened from {}",
            info.transport, info.node_id, info.peer_addr
        );
        if let Some(hook) = &self.hooks.on_open {
            hook(info);
        }
    }

    /// Revoke the connection's subscriptions and run the close hook.
    pub(crate) async fn closed(&self, info: &ConnectionInfo) {
        if let Err(e) = self.shared.broker.unsubscribe_all(&info.node_id).await {
            self.report(&ServerError::Broker(e));
        }
        debug!(
            "{} connection {} from {} closed",
            info.transport, info.node_id, info.peer_addr
        );
        if let Some(hook) = &self.hooks.on_close {
            hook(info);
        }
    }

    pub(crate) fn report(&self, err: &ServerError) {
        if let Some(hook) = &self.hooks.on_error {
            hook(err);
        }
    }
}

fn topic(ctx: &Context) -> std::result::Result<String, Fault> {
    String::from_utf8(ctx.body().to_vec())
        .map_err(|e| Fault::Param(CoderError::Decode(format!("listener topic: {e}"))))
}

/// Builder for [`Server`].
#[must_use]
pub struct ServerBuilder {
    router: Router,
    config: ServerConfig,
    broker: Option<Arc<dyn Broker>>,
    coders: CoderRegistry,
    hooks: Hooks,
    ping: Option<Arc<dyn Handler>>,
}

impl ServerBuilder {
    /// Set the configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `broker` instead of a private [`MemoryBroker`].
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Replace the coder registry.
    pub fn coders(mut self, coders: CoderRegistry) -> Self {
        self.coders = coders;
        self
    }

    /// Run `hook` when a connection opens.
    pub fn on_open(mut self, hook: impl Fn(&ConnectionInfo) + Send + Sync + 'static) -> Self {
        self.hooks.on_open = Some(Arc::new(hook));
        self
    }

    /// Run `hook` after a connection closed and its subscriptions were revoked.
    pub fn on_close(mut self, hook: impl Fn(&ConnectionInfo) + Send + Sync + 'static) -> Self {
        self.hooks.on_close = Some(Arc::new(hook));
        self
    }

    /// Run `hook` for connection failures and handler panics.
    pub fn on_error(mut self, hook: impl Fn(&ServerError) + Send + Sync + 'static) -> Self {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    /// Answer heartbeats with `handler` instead of an empty success.
    pub fn on_ping(mut self, handler: impl Handler) -> Self {
        self.ping = Some(Arc::new(handler));
        self
    }

    /// Build the server. No endpoint is started yet.
    pub fn build(self) -> Server {
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(MemoryBroker::new()));

        let shared = Arc::new(Shared {
            broker,
            coders: self.coders,
            plugins: self.config.plugins.clone(),
            max_payload: self.config.max_payload,
            content_type: self.config.content_type.clone(),
        });

        Server {
            inner: Arc::new(ServerInner {
                config: self.config,
                shutdown: CancellationToken::new(),
                router: self.router,
                shared,
                hooks: self.hooks,
                ping: self.ping,
            }),
        }
    }
}

/// Serves one router over any number of TCP, UDP and WebSocket endpoints.
///
/// All endpoints share the router and the broker, so a message published from
/// a TCP request reaches WebSocket subscribers too.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Start building a server around `router`.
    pub fn builder(router: Router) -> ServerBuilder {
        ServerBuilder {
            router,
            config: ServerConfig::default(),
            broker: None,
            coders: CoderRegistry::default(),
            hooks: Hooks::default(),
            ping: None,
        }
    }

    /// Create a server with a private in-memory broker.
    #[must_use]
    pub fn new(router: Router, config: ServerConfig) -> Self {
        Self::builder(router).config(config).build()
    }

    /// The broker shared by all endpoints.
    #[must_use]
    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.inner.shared.broker)
    }

    /// The server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Listen for TCP connections.
    ///
    /// Returns the bound address; the accept loop runs until [`Server::shutdown`].
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start_tcp(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("TCP server listening on {}", local_addr);

        tokio::spawn(tcp::accept_loop(Arc::clone(&self.inner), listener));
        Ok(local_addr)
    }

    /// Listen for UDP datagrams.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start_udp(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("UDP server listening on {}", local_addr);

        tokio::spawn(udp::receive_loop(Arc::clone(&self.inner), Arc::new(socket)));
        Ok(local_addr)
    }

    /// Serve WebSocket upgrades at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start_websocket(&self, addr: impl ToSocketAddrs, path: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("WebSocket server listening on ws://{}{}", local_addr, path);

        let app = self.websocket_router(path);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned());
            if let Err(e) = serve.await {
                error!("WebSocket server on {} failed: {}", local_addr, e);
            }
        });
        Ok(local_addr)
    }

    /// An axum router serving WebSocket upgrades at `path`, for mounting into
    /// an existing application.
    ///
    /// The application must be served with
    /// `into_make_service_with_connect_info::<SocketAddr>()`.
    pub fn websocket_router(&self, path: &str) -> axum::Router {
        websocket::router(Arc::clone(&self.inner), path)
    }

    /// Stop every endpoint and close every connection.
    pub fn shutdown(&self) {
        info!("Server shutdown requested");
        self.inner.shutdown.cancel();
    }

    /// Returns `true` once [`Server::shutdown`] has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("router", &self.inner.router)
            .field("config", &self.inner.config)
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::Capture;
    use std::time::Duration;
    use tether_packet::{HeaderBag, MAX_PAYLOAD, operator};
    use tokio::sync::mpsc;

    fn server(router: Router) -> Arc<ServerInner> {
        Arc::clone(&Server::new(router, ServerConfig::default()).inner)
    }

    async fn roundtrip(server: &Arc<ServerInner>, packet: Packet) -> (Packet, HeaderBag) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = server.context(
            Arc::new(Capture(tx)),
            Arc::from("node"),
            &CancellationToken::new(),
            packet,
        );
        server.dispatch(ctx).await;
        let response = Packet::decode(rx.recv().await.unwrap(), MAX_PAYLOAD).unwrap();
        let header = HeaderBag::from_bytes(&response.header);
        (response, header)
    }

    #[tokio::test]
    async fn test_handler_without_response_gets_empty_success() {
        let mut router = Router::new();
        router
            .handle_func("/v1/silent", |_ctx: Context| async move { Ok(()) })
            .unwrap();

        let (response, header) =
            roundtrip(&server(router), Packet::new(operator("/v1/silent"), 3, "", "")).await;
        assert_eq!(response.sequence, 3);
        assert!(response.body.is_empty());
        assert_eq!(header.get("code"), None);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let mut router = Router::new();
        router
            .handle_func("/v1/fail", |_ctx: Context| async move {
                Err(Fault::from("database unavailable"))
            })
            .unwrap();

        let (response, header) =
            roundtrip(&server(router), Packet::new(operator("/v1/fail"), 4, "", "")).await;
        assert_eq!(response.sequence, 4);
        assert_eq!(header.get("code"), Some("500"));
        assert_eq!(header.get("message"), Some("database unavailable"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        async fn explode(_ctx: Context) -> HandlerResult {
            panic!("kaboom")
        }
        let mut router = Router::new();
        router.handle_func("/v1/panic", explode).unwrap();

        let (_, header) =
            roundtrip(&server(router), Packet::new(operator("/v1/panic"), 4, "", "")).await;
        assert_eq!(header.get("code"), Some("500"));
        assert_eq!(header.get("message"), Some("Handler panicked: kaboom"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (_, header) = roundtrip(&server(Router::new()), Packet::new(99_999, 1, "", "")).await;
        assert_eq!(header.get("code"), Some("404"));
    }

    #[tokio::test]
    async fn test_heartbeat_default_and_custom() {
        let (response, header) =
            roundtrip(&server(Router::new()), Packet::new(OPERATOR_HEARTBEAT, 9, "", "")).await;
        assert_eq!(response.operator, OPERATOR_HEARTBEAT);
        assert_eq!(response.sequence, 9);
        assert_eq!(header.get("code"), None);

        let server = Server::builder(Router::new())
            .on_ping(|ctx: Context| async move { ctx.success_raw("pong").await })
            .build();
        let (response, _) = roundtrip(&server.inner, Packet::new(OPERATOR_HEARTBEAT, 9, "", "")).await;
        assert_eq!(&response.body[..], b"pong");
    }

    #[tokio::test]
    async fn test_register_on_closed_connection_leaves_no_subscription() {
        let broker = Arc::new(MemoryBroker::new());
        let server = Server::builder(Router::new()).broker(broker.clone()).build();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = server.inner.context(
            Arc::new(Capture(tx)),
            Arc::from("node"),
            &cancel,
            Packet::new(OPERATOR_REGISTER_LISTENER, 1, "", "news"),
        );
        server.inner.dispatch(ctx).await;
        assert_eq!(broker.subscriber_count("news"), 0);

        let frame = rx.recv().await.unwrap();
        let header = HeaderBag::from_bytes(&Packet::decode(frame, MAX_PAYLOAD).unwrap().header);
        assert_eq!(header.get("code"), Some("500"));

        broker.publish("news", Bytes::from_static(b"late")).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_request_on_closed_connection_is_dropped() {
        let broker = Arc::new(MemoryBroker::new());
        let server = Server::builder(Router::new()).broker(broker.clone()).build();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = server.inner.context(
            Arc::new(Capture(tx)),
            Arc::from("node"),
            &cancel,
            Packet::new(OPERATOR_REGISTER_LISTENER, 1, "", "news"),
        );
        server.inner.spawn_dispatch(ctx);

        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
        assert_eq!(broker.subscriber_count("news"), 0);
    }

    #[tokio::test]
    async fn test_register_listener_requires_topic() {
        let (_, header) = roundtrip(
            &server(Router::new()),
            Packet::new(OPERATOR_REGISTER_LISTENER, 1, "", ""),
        )
        .await;
        assert_eq!(header.get("code"), Some("400"));
    }
}
