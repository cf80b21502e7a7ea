//! Transform pipeline applied to header and body bytes.
//!
//! Plugins run in registration order when a packet is sent and in reverse
//! order when one is received, so a chain configured identically on both
//! ends undoes itself.

mod crypt;
mod debug;

pub use crypt::Crypt;
pub use debug::DebugLog;

use crate::error::Result;
use crate::packet::Packet;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// A symmetric transform over header and body bytes.
pub trait PacketPlugin: Send + Sync + 'static {
    /// Transform outbound bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes cannot be transformed.
    fn on_send(&self, operator: u32, header: Bytes, body: Bytes) -> Result<(Bytes, Bytes)>;

    /// Undo [`PacketPlugin::on_send`] on inbound bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes were not produced by a matching plugin.
    fn on_receive(&self, operator: u32, header: Bytes, body: Bytes) -> Result<(Bytes, Bytes)>;
}

/// An ordered list of plugins shared by every packet on an endpoint.
#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn PacketPlugin>>,
}

impl PluginChain {
    /// Create an empty chain.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// Append a plugin.
    #[must_use]
    pub fn with(mut self, plugin: impl PacketPlugin) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Append a shared plugin.
    pub fn push(&mut self, plugin: Arc<dyn PacketPlugin>) {
        self.plugins.push(plugin);
    }

    /// Number of plugins in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Returns `true` if the chain has no plugins.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Apply every plugin's send transform, first to last.
    ///
    /// # Errors
    ///
    /// Stops at the first plugin that fails.
    pub fn seal(&self, mut packet: Packet) -> Result<Packet> {
        for plugin in &self.plugins {
            let (header, body) = plugin.on_send(packet.operator, packet.header, packet.body)?;
            packet.header = header;
            packet.body = body;
        }
        Ok(packet)
    }

    /// Apply every plugin's receive transform, last to first.
    ///
    /// # Errors
    ///
    /// Stops at the first plugin that fails.
    pub fn open(&self, mut packet: Packet) -> Result<Packet> {
        for plugin in self.plugins.iter().rev() {
            let (header, body) = plugin.on_receive(packet.operator, packet.header, packet.body)?;
            packet.header = header;
            packet.body = body;
        }
        Ok(packet)
    }
}

impl fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginChain")
            .field("len", &self.plugins.len())
            .finish()
    }
}
