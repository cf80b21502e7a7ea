//! Dialing for each network kind.

use crate::config::{Network, SessionConfig};
use crate::error::{ClientError, Result};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt, TryStreamExt, future, sink, stream};
use std::pin::Pin;
use std::sync::Arc;
use tether_packet::{Packet, PacketCodec};
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tracing::trace;

/// Write half of a connection, taking encoded frames.
pub(crate) type FrameSink = Pin<Box<dyn Sink<Bytes, Error = ClientError> + Send>>;

/// Read half of a connection, yielding raw packets.
pub(crate) type FrameStream = BoxStream<'static, Result<Packet>>;

/// Open a connection to `address` within the configured dial timeout.
pub(crate) async fn dial(
    network: &Network,
    address: &str,
    config: &SessionConfig,
) -> Result<(FrameSink, FrameStream)> {
    let connect = async {
        match network {
            Network::Tcp => dial_tcp(address, config).await,
            Network::Udp => dial_udp(address, config).await,
            Network::WebSocket { path } => dial_websocket(address, path, config).await,
        }
    };

    tokio::time::timeout(config.dial_timeout, connect)
        .await
        .map_err(|_| ClientError::Connect {
            address: address.to_string(),
            reason: format!("timed out after {:?}", config.dial_timeout),
        })?
        .map_err(|e| match e {
            ClientError::Connect { .. } => e,
            other => ClientError::Connect {
                address: address.to_string(),
                reason: other.to_string(),
            },
        })
}

async fn dial_tcp(address: &str, config: &SessionConfig) -> Result<(FrameSink, FrameStream)> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();

    let sink = SinkExt::<Bytes>::sink_map_err(
        FramedWrite::new(write_half, BytesCodec::new()),
        ClientError::Io,
    );
    let codec = PacketCodec::new().with_max_payload(config.max_payload);
    let frames = FramedRead::new(read_half, codec).map_err(ClientError::Packet);

    Ok((Box::pin(sink), frames.boxed()))
}

async fn dial_udp(address: &str, config: &SessionConfig) -> Result<(FrameSink, FrameStream)> {
    let remote = lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| ClientError::Connect {
            address: address.to_string(),
            reason: "address did not resolve".to_string(),
        })?;
    let local = if remote.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };

    let socket = Arc::new(UdpSocket::bind(local).await?);
    socket.connect(remote).await?;

    let sink = sink::unfold(Arc::clone(&socket), |socket, frame: Bytes| async move {
        socket.send(&frame).await?;
        Ok::<_, ClientError>(socket)
    });

    let max_payload = config.max_payload;
    let buffer = vec![0u8; config.udp_payload.max(1)];
    let frames = stream::unfold((socket, buffer), move |(socket, mut buffer)| async move {
        loop {
            match socket.recv(&mut buffer).await {
                Ok(len) => {
                    let datagram = Bytes::copy_from_slice(&buffer[..len]);
                    match Packet::decode(datagram, max_payload) {
                        Ok(packet) => return Some((Ok(packet), (socket, buffer))),
                        Err(e) => trace!("Dropped malformed datagram: {}", e),
                    }
                }
                // Refused datagrams surface here; the next one may succeed.
                Err(e) => trace!("Datagram receive failed: {}", e),
            }
        }
    });

    Ok((Box::pin(sink), frames.boxed()))
}

async fn dial_websocket(
    address: &str,
    path: &str,
    config: &SessionConfig,
) -> Result<(FrameSink, FrameStream)> {
    let url = format!("ws://{address}{path}");
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(ClientError::from)
        .with(|frame: Bytes| future::ready(Ok::<_, ClientError>(Message::Binary(frame))));

    let max_payload = config.max_payload;
    let frames = stream.filter_map(move |message| {
        future::ready(match message {
            Ok(Message::Binary(data)) => {
                Some(Packet::decode(data, max_payload).map_err(ClientError::from))
            }
            Ok(_) => None,
            Err(e) => Some(Err(ClientError::from(e))),
        })
    });

    Ok((Box::pin(sink), frames.boxed()))
}
