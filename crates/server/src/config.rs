//! Server configuration.

use std::time::Duration;
use tether_coder::CONTENT_TYPE_JSON;
use tether_packet::{MAX_PAYLOAD, PluginChain};

/// Default idle deadline for a connection.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration shared by every endpoint of a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Close a connection when no packet arrives within this window.
    pub timeout: Option<Duration>,
    /// Largest accepted frame, prefix included.
    pub max_payload: usize,
    /// Content type used when a request does not name one.
    pub content_type: String,
    /// Outbound frames buffered per connection.
    pub send_queue_size: usize,
    /// Initial read buffer capacity for stream connections.
    pub read_buffer_size: usize,
    /// Receive buffer for one datagram.
    pub udp_payload: usize,
    /// Transforms applied to every packet.
    pub plugins: PluginChain,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT),
            max_payload: MAX_PAYLOAD,
            content_type: CONTENT_TYPE_JSON.to_string(),
            send_queue_size: 1024,
            read_buffer_size: 8 * 1024,
            udp_payload: 4096,
            plugins: PluginChain::new(),
        }
    }
}

impl ServerConfig {
    /// Set the idle deadline, or disable it with `None`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Set the default content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set the per-connection send queue length.
    #[must_use]
    pub const fn with_send_queue_size(mut self, size: usize) -> Self {
        self.send_queue_size = size;
        self
    }

    /// Set the datagram receive buffer.
    #[must_use]
    pub const fn with_udp_payload(mut self, size: usize) -> Self {
        self.udp_payload = size;
        self
    }

    /// Set the packet plugins.
    #[must_use]
    pub fn with_plugins(mut self, plugins: PluginChain) -> Self {
        self.plugins = plugins;
        self
    }
}
