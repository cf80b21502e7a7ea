use super::{run_connection, with_deadline};
use crate::context::{Outbound, StreamOutbound, Transport};
use crate::error::{Result, ServerError};
use crate::server::{ConnectionInfo, ServerInner};
use bytes::Bytes;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_packet::PacketCodec;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};
use uuid::Uuid;

pub(crate) async fn accept_loop(server: Arc<ServerInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            () = server.shutdown.cancelled() => {
                info!("TCP listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!("Accepted TCP connection from {}", peer);
                    tokio::spawn(serve(Arc::clone(&server), stream, peer));
                }
                Err(e) => error!("Failed to accept TCP connection: {}", e),
            }
        }
    }
}

#[instrument(skip(server, stream))]
async fn serve(server: Arc<ServerInner>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let cancel = server.shutdown.child_token();
    let info = ConnectionInfo {
        node_id: Arc::from(Uuid::new_v4().to_string()),
        peer_addr: peer,
        transport: Transport::Stream,
    };

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(server.config.send_queue_size.max(1));
    let writer = tokio::spawn(write_loop(write_half, rx, cancel.clone()));

    let outbound: Arc<dyn Outbound> = Arc::new(StreamOutbound::new(tx, cancel.clone(), peer));
    let read = read_loop(&server, read_half, outbound, &info, &cancel);
    run_connection(&server, &info, &cancel, read).await;

    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Writer for {} failed: {}", info.node_id, e),
        Err(e) => debug!("Writer for {} ended abnormally: {}", info.node_id, e),
    }
}

async fn read_loop(
    server: &Arc<ServerInner>,
    read_half: OwnedReadHalf,
    outbound: Arc<dyn Outbound>,
    info: &ConnectionInfo,
    cancel: &CancellationToken,
) -> Result<()> {
    let codec = PacketCodec::new().with_max_payload(server.config.max_payload);
    let mut frames = FramedRead::with_capacity(read_half, codec, server.config.read_buffer_size);

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = with_deadline(server.config.timeout, frames.next()) => next?,
        };

        let Some(frame) = next else {
            trace!("Peer {} closed the stream", info.peer_addr);
            return Ok(());
        };

        let packet = server.open(frame?)?;
        let ctx = server.context(
            Arc::clone(&outbound),
            Arc::clone(&info.node_id),
            cancel,
            packet,
        );
        server.spawn_dispatch(ctx);
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> Result<()> {
    let result = loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else {
            break Ok(());
        };
        if let Err(e) = write_half.write_all(&frame).await {
            break Err(ServerError::Io(e));
        }
    };

    cancel.cancel();
    if let Err(e) = write_half.shutdown().await {
        trace!("Failed to shut down write half: {}", e);
    }
    result
}
