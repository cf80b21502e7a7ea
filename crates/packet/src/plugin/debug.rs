use super::PacketPlugin;
use crate::error::Result;
use bytes::Bytes;
use tracing::debug;

/// Logs every packet passing through the chain and leaves it untouched.
///
/// Place it first in the chain to see plaintext on both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugLog;

impl PacketPlugin for DebugLog {
    fn on_send(&self, operator: u32, header: Bytes, body: Bytes) -> Result<(Bytes, Bytes)> {
        debug!(
            "[send packet] operator: {}, header: {}, body: {}",
            operator,
            String::from_utf8_lossy(&header),
            String::from_utf8_lossy(&body)
        );
        Ok((header, body))
    }

    fn on_receive(&self, operator: u32, header: Bytes, body: Bytes) -> Result<(Bytes, Bytes)> {
        debug!(
            "[receive packet] operator: {}, header: {}, body: {}",
            operator,
            String::from_utf8_lossy(&header),
            String::from_utf8_lossy(&body)
        );
        Ok((header, body))
    }
}
