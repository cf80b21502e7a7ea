//! Session and pool configuration.

use crate::error::{ClientError, PoolError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_coder::{CONTENT_TYPE_JSON, CoderRegistry};
use tether_packet::{MAX_PAYLOAD, PluginChain};

/// Default bound on dialing and on waiting for a pooled session.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Default heartbeat period of pooled sessions.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

/// Called with the server address when a session opens or closes.
pub type AddressHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Called when a session fails.
pub type SessionErrorHook = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Called when the pool fails to produce a session.
pub type PoolErrorHook = Arc<dyn Fn(&PoolError) + Send + Sync>;

/// Transport a session dials.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Network {
    /// Length-prefixed frames over TCP.
    #[default]
    Tcp,
    /// One packet per UDP datagram.
    Udp,
    /// One packet per binary WebSocket message, served at `path`.
    WebSocket {
        /// Request path of the upgrade, e.g. `/ws`.
        path: String,
    },
}

/// Configuration of one [`Session`](crate::Session).
#[derive(Clone)]
pub struct SessionConfig {
    /// Content type of request and response bodies.
    pub content_type: String,
    /// Coders available to the session.
    pub coders: CoderRegistry,
    /// Largest accepted frame, prefix included.
    pub max_payload: usize,
    /// Receive buffer for one datagram.
    pub udp_payload: usize,
    /// Bound on establishing the connection.
    pub dial_timeout: Duration,
    /// Outbound frames buffered before senders wait.
    pub send_queue_size: usize,
    /// Transforms applied to every packet.
    pub plugins: PluginChain,
    /// Runs once the session is open.
    pub on_open: Option<AddressHook>,
    /// Runs once the session has closed.
    pub on_close: Option<AddressHook>,
    /// Runs when the connection fails.
    pub on_error: Option<SessionErrorHook>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            content_type: CONTENT_TYPE_JSON.to_string(),
            coders: CoderRegistry::default(),
            max_payload: MAX_PAYLOAD,
            udp_payload: 4096,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            send_queue_size: 1024,
            plugins: PluginChain::new(),
            on_open: None,
            on_close: None,
            on_error: None,
        }
    }
}

impl SessionConfig {
    /// Set the body content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Replace the coder registry.
    #[must_use]
    pub fn with_coders(mut self, coders: CoderRegistry) -> Self {
        self.coders = coders;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Set the datagram receive buffer.
    #[must_use]
    pub const fn with_udp_payload(mut self, udp_payload: usize) -> Self {
        self.udp_payload = udp_payload;
        self
    }

    /// Set the dial timeout.
    #[must_use]
    pub const fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the outbound queue length.
    #[must_use]
    pub const fn with_send_queue_size(mut self, size: usize) -> Self {
        self.send_queue_size = size;
        self
    }

    /// Set the packet plugins. Both ends must use the same chain.
    #[must_use]
    pub fn with_plugins(mut self, plugins: PluginChain) -> Self {
        self.plugins = plugins;
        self
    }

    /// Run `hook` once the session is open.
    #[must_use]
    pub fn on_open(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(hook));
        self
    }

    /// Run `hook` once the session has closed.
    #[must_use]
    pub fn on_close(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }

    /// Run `hook` when the connection fails.
    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("content_type", &self.content_type)
            .field("max_payload", &self.max_payload)
            .field("udp_payload", &self.udp_payload)
            .field("dial_timeout", &self.dial_timeout)
            .field("send_queue_size", &self.send_queue_size)
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

/// Configuration of a [`Pool`](crate::Pool).
#[derive(Clone)]
pub struct PoolConfig {
    /// Transport of every pooled session.
    pub network: Network,
    /// Sessions opened up front and kept open by maintenance.
    pub initial_cap: usize,
    /// Upper bound on live sessions.
    pub max_cap: usize,
    /// Idle sessions older than this are closed instead of reused.
    pub idle_timeout: Option<Duration>,
    /// Bound on dialing, on health checks and on waiting for a free session.
    pub dial_timeout: Duration,
    /// Heartbeat and maintenance period.
    pub ping_interval: Duration,
    /// Configuration of every pooled session. Its dial timeout is replaced
    /// by the pool's.
    pub session: SessionConfig,
    /// Runs with the address of every session the pool opens.
    pub on_open: Option<AddressHook>,
    /// Runs with the address of every session the pool discards.
    pub on_close: Option<AddressHook>,
    /// Runs when producing a session fails.
    pub on_error: Option<PoolErrorHook>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            initial_cap: 10,
            max_cap: 30,
            idle_timeout: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            session: SessionConfig::default(),
            on_open: None,
            on_close: None,
            on_error: None,
        }
    }
}

impl PoolConfig {
    /// Set the transport.
    #[must_use]
    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    /// Set the number of sessions opened up front.
    #[must_use]
    pub const fn with_initial_cap(mut self, initial_cap: usize) -> Self {
        self.initial_cap = initial_cap;
        self
    }

    /// Set the maximum number of live sessions.
    #[must_use]
    pub const fn with_max_cap(mut self, max_cap: usize) -> Self {
        self.max_cap = max_cap;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the dial timeout.
    #[must_use]
    pub const fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the heartbeat and maintenance period.
    #[must_use]
    pub const fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the session configuration.
    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Run `hook` when the pool opens a session.
    #[must_use]
    pub fn on_open(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(hook));
        self
    }

    /// Run `hook` when the pool discards a session.
    #[must_use]
    pub fn on_close(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }

    /// Run `hook` when producing a session fails.
    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&PoolError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("network", &self.network)
            .field("initial_cap", &self.initial_cap)
            .field("max_cap", &self.max_cap)
            .field("idle_timeout", &self.idle_timeout)
            .field("dial_timeout", &self.dial_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
