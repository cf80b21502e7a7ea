//! Wire protocol for tether.
//!
//! Every message on every transport is a [`Packet`]: a route identifier
//! ([operator](operator::operator)), a correlation sequence, a `key=value;`
//! header and an opaque body. Packets are framed with a fixed 20 byte
//! big-endian prefix and pass through a [`PluginChain`] of symmetric
//! transforms on their way in and out.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod codec;
mod error;
mod header;
pub mod operator;
mod packet;
pub mod plugin;

pub use codec::PacketCodec;
pub use error::{PacketError, Result};
pub use header::{HeaderBag, PROPERTY_CODE, PROPERTY_CONTENT_TYPE, PROPERTY_MESSAGE};
pub use operator::{
    OPERATOR_HEARTBEAT, OPERATOR_MAX, OPERATOR_REGISTER_LISTENER, OPERATOR_REMOVE_LISTENER,
    correlation_key, is_reserved, operator,
};
pub use packet::{MAX_PAYLOAD, PREFIX_LEN, Packet, peek_frame_len};
pub use plugin::{PacketPlugin, PluginChain};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
