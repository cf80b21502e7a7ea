//! Write side of each transport.

use crate::error::{Result, ServerError};
use async_trait::async_trait;
use axum::extract::ws::Message;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Kind of transport a [`Context`](super::Context) arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Length-prefixed frames over TCP.
    Stream,
    /// One packet per UDP datagram.
    Datagram,
    /// One packet per WebSocket binary message.
    Message,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => f.write_str("tcp"),
            Self::Datagram => f.write_str("udp"),
            Self::Message => f.write_str("websocket"),
        }
    }
}

/// Sends framed packets back to the peer.
#[async_trait]
pub trait Outbound: Send + Sync + 'static {
    /// Write one encoded frame.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Transport kind.
    fn transport(&self) -> Transport;

    /// Remote address, if known.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Queue feeding a TCP connection's writer task.
#[derive(Debug)]
pub struct StreamOutbound {
    queue: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    peer: SocketAddr,
}

impl StreamOutbound {
    pub(crate) const fn new(
        queue: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
        peer: SocketAddr,
    ) -> Self {
        Self {
            queue,
            cancel,
            peer,
        }
    }
}

#[async_trait]
impl Outbound for StreamOutbound {
    async fn send(&self, frame: Bytes) -> Result<()> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(ServerError::Closed),
            sent = self.queue.send(frame) => sent.map_err(|_| ServerError::Closed),
        }
    }

    fn transport(&self) -> Transport {
        Transport::Stream
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

/// Shared UDP socket plus the address the datagram came from.
#[derive(Debug)]
pub struct DatagramOutbound {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl DatagramOutbound {
    pub(crate) const fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

#[async_trait]
impl Outbound for DatagramOutbound {
    async fn send(&self, frame: Bytes) -> Result<()> {
        self.socket.send_to(&frame, self.peer).await?;
        Ok(())
    }

    fn transport(&self) -> Transport {
        Transport::Datagram
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

/// Queue feeding a WebSocket's sender task.
#[derive(Debug)]
pub struct MessageOutbound {
    queue: mpsc::Sender<Message>,
    cancel: CancellationToken,
    peer: SocketAddr,
}

impl MessageOutbound {
    pub(crate) const fn new(
        queue: mpsc::Sender<Message>,
        cancel: CancellationToken,
        peer: SocketAddr,
    ) -> Self {
        Self {
            queue,
            cancel,
            peer,
        }
    }
}

#[async_trait]
impl Outbound for MessageOutbound {
    async fn send(&self, frame: Bytes) -> Result<()> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(ServerError::Closed),
            sent = self.queue.send(Message::Binary(frame)) => sent.map_err(|_| ServerError::Closed),
        }
    }

    fn transport(&self) -> Transport {
        Transport::Message
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}
