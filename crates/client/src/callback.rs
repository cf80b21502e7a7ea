//! Responses and request status callbacks.

use crate::error::{ClientError, Result};
use bytes::Bytes;
use tether_packet::{HeaderBag, PROPERTY_CODE, PROPERTY_MESSAGE, Packet};

/// Status reported for a response whose `code` property is not a number.
const STATUS_UNPARSEABLE: i32 = 500;

/// A packet received from the server.
#[derive(Debug, Clone)]
pub struct Response {
    /// Operator of the request, or of the topic for pushed messages.
    pub operator: u32,
    /// Sequence of the request, or 0 for pushed messages.
    pub sequence: i64,
    /// Response header properties.
    pub header: HeaderBag,
    /// Encoded body.
    pub body: Bytes,
}

impl Response {
    pub(crate) fn from_packet(packet: Packet) -> Self {
        Self {
            operator: packet.operator,
            sequence: packet.sequence,
            header: HeaderBag::from_bytes(&packet.header),
            body: packet.body,
        }
    }

    /// Synthetic error delivered to handlers still waiting when the session closes.
    pub(crate) fn failed(operator: u32, sequence: i64, code: i32, message: &str) -> Self {
        let mut header = HeaderBag::new();
        header.set(PROPERTY_CODE, &code.to_string());
        header.set(PROPERTY_MESSAGE, message);
        Self {
            operator,
            sequence,
            header,
            body: Bytes::new(),
        }
    }

    /// Read a response header property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.header.get(key)
    }

    /// Error status, if the server reported one.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        self.header
            .get(PROPERTY_CODE)
            .filter(|code| !code.is_empty())
            .map(|code| code.parse().unwrap_or(STATUS_UNPARSEABLE))
    }

    /// Error message, empty on success.
    #[must_use]
    pub fn message(&self) -> &str {
        self.header.get(PROPERTY_MESSAGE).unwrap_or_default()
    }

    /// Returns `true` if the server reported an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.code().is_some()
    }

    /// Turn an error response into [`ClientError::Remote`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Remote`] if the response carries an error status.
    pub fn into_result(self) -> Result<Self> {
        match self.code() {
            Some(code) => Err(ClientError::Remote {
                code,
                message: self.message().to_string(),
            }),
            None => Ok(self),
        }
    }
}

/// Observes one request from start to end.
pub trait RequestStatusCallback: Send + Sync + 'static {
    /// Runs before the request is sent.
    fn on_start(&self) {}

    /// Runs with a successful response.
    fn on_success(&self, response: &Response);

    /// Runs with the status and message of an error response.
    fn on_error(&self, _code: i32, _message: &str) {}

    /// Runs after `on_success` or `on_error`.
    fn on_end(&self) {}
}

/// Route a response to `on_success` or `on_error`, then `on_end`.
pub(crate) fn deliver<C>(callback: &C, response: &Response)
where
    C: RequestStatusCallback + ?Sized,
{
    match response.code() {
        Some(code) => callback.on_error(code, response.message()),
        None => callback.on_success(response),
    }
    callback.on_end();
}
