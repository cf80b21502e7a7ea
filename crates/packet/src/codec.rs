//! Stream framing for byte-oriented transports.

use crate::error::{PacketError, Result};
use crate::packet::{MAX_PAYLOAD, Packet, peek_frame_len};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Codec that splits a byte stream into [`Packet`]s.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_payload: usize,
}

impl PacketCodec {
    /// Create a codec with the default maximum payload.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_payload: MAX_PAYLOAD,
        }
    }

    /// Create a codec with a custom maximum payload.
    #[must_use]
    pub const fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Maximum frame size accepted by this codec.
    #[must_use]
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = PacketError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Size is validated here, before any reservation for the body.
        let Some(frame_len) = peek_frame_len(buf, self.max_payload)? else {
            return Ok(None);
        };

        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let frame = buf.split_to(frame_len).freeze();
        Packet::decode(frame, self.max_payload).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(buf)? {
            Some(packet) => Ok(Some(packet)),
            None if buf.is_empty() => Ok(None),
            None => {
                let expected = peek_frame_len(buf, self.max_payload)?
                    .unwrap_or(crate::packet::PREFIX_LEN);
                Err(PacketError::Truncated {
                    expected,
                    actual: buf.len(),
                })
            }
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = PacketError;

    fn encode(&mut self, packet: Packet, buf: &mut BytesMut) -> Result<()> {
        packet.encode_into(buf, self.max_payload)
    }
}
