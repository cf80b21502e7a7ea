use crate::context::{DatagramOutbound, Outbound};
use crate::server::ServerInner;
use bytes::Bytes;
use std::sync::Arc;
use tether_packet::Packet;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

/// Every datagram is a self-contained request. Subscriptions made over UDP
/// are keyed by the peer address and live until removed explicitly.
pub(crate) async fn receive_loop(server: Arc<ServerInner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; server.config.udp_payload.max(1)];

    loop {
        let received = tokio::select! {
            () = server.shutdown.cancelled() => {
                info!("UDP listener shutting down");
                break;
            }
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, peer) = match received {
            Ok(received) => received,
            Err(e) => {
                error!("Failed to receive datagram: {}", e);
                continue;
            }
        };

        let datagram = Bytes::copy_from_slice(&buf[..len]);
        let packet = match Packet::decode(datagram, server.config.max_payload)
            .and_then(|packet| server.config.plugins.open(packet))
        {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropped malformed datagram from {}: {}", peer, e);
                continue;
            }
        };

        let outbound: Arc<dyn Outbound> = Arc::new(DatagramOutbound::new(Arc::clone(&socket), peer));
        let node_id: Arc<str> = Arc::from(format!("udp:{peer}"));
        let ctx = server.context(outbound, node_id, &server.shutdown, packet);
        server.spawn_dispatch(ctx);
    }
}
