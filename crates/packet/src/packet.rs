//! The wire unit and its fixed-width layout.
//!
//! ```text
//! u32 operator | i64 sequence | u32 header_len | u32 body_len | header | body
//! ```
//!
//! All integers are big-endian.

use crate::error::{PacketError, Result};
use crate::operator::correlation_key;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length of the fixed prefix preceding header and body.
pub const PREFIX_LEN: usize = 20;

/// Default ceiling for a whole frame, prefix included.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// A single framed message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    /// Route identifier.
    pub operator: u32,
    /// Correlation number chosen by the sender.
    pub sequence: i64,
    /// Property bag bytes.
    pub header: Bytes,
    /// Application payload.
    pub body: Bytes,
}

impl Packet {
    /// Create a new packet.
    pub fn new(
        operator: u32,
        sequence: i64,
        header: impl Into<Bytes>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            operator,
            sequence,
            header: header.into(),
            body: body.into(),
        }
    }

    /// Size of the packet once framed.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        PREFIX_LEN
            .saturating_add(self.header.len())
            .saturating_add(self.body.len())
    }

    /// Key the receiving side uses to find the waiting request.
    #[must_use]
    pub const fn correlation_key(&self) -> i64 {
        correlation_key(self.operator, self.sequence)
    }

    /// Frame the packet into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::TooLarge`] before allocating if the frame would
    /// exceed `max_payload`.
    pub fn encode(&self, max_payload: usize) -> Result<Bytes> {
        check_size(self.frame_len(), max_payload)?;
        let mut buf = BytesMut::with_capacity(self.frame_len());
        self.write_to(&mut buf);
        Ok(buf.freeze())
    }

    /// Frame the packet onto the end of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::TooLarge`] if the frame would exceed `max_payload`.
    pub fn encode_into(&self, buf: &mut BytesMut, max_payload: usize) -> Result<()> {
        check_size(self.frame_len(), max_payload)?;
        buf.reserve(self.frame_len());
        self.write_to(buf);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.operator);
        buf.put_i64(self.sequence);
        buf.put_u32(self.header.len() as u32);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.header);
        buf.put_slice(&self.body);
    }

    /// Unframe exactly one packet from `frame`.
    ///
    /// Header and body share the frame's allocation.
    ///
    /// # Errors
    ///
    /// Fails if the frame is shorter than its prefix declares, longer than it
    /// declares, or larger than `max_payload`.
    pub fn decode(mut frame: Bytes, max_payload: usize) -> Result<Self> {
        let Some(total) = peek_frame_len(&frame, max_payload)? else {
            return Err(PacketError::Truncated {
                expected: PREFIX_LEN,
                actual: frame.len(),
            });
        };

        if frame.len() < total {
            return Err(PacketError::Truncated {
                expected: total,
                actual: frame.len(),
            });
        }
        if frame.len() > total {
            return Err(PacketError::LengthMismatch {
                declared: total,
                actual: frame.len(),
            });
        }

        let operator = frame.get_u32();
        let sequence = frame.get_i64();
        let header_len = frame.get_u32() as usize;
        frame.advance(4);
        let header = frame.split_to(header_len);

        Ok(Self {
            operator,
            sequence,
            header,
            body: frame,
        })
    }
}

/// Reads the prefix of `buf` without consuming it and returns the full frame
/// length, or `None` if the prefix is not complete yet.
///
/// # Errors
///
/// Returns [`PacketError::TooLarge`] when the declared frame exceeds
/// `max_payload`.
pub fn peek_frame_len(buf: &[u8], max_payload: usize) -> Result<Option<usize>> {
    if buf.len() < PREFIX_LEN {
        return Ok(None);
    }

    let mut prefix = &buf[12..PREFIX_LEN];
    let header_len = prefix.get_u32() as usize;
    let body_len = prefix.get_u32() as usize;
    let total = PREFIX_LEN
        .saturating_add(header_len)
        .saturating_add(body_len);

    check_size(total, max_payload)?;
    Ok(Some(total))
}

fn check_size(size: usize, max: usize) -> Result<()> {
    if size > max {
        return Err(PacketError::TooLarge { size, max });
    }
    Ok(())
}
