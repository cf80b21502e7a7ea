use super::{run_connection, with_deadline};
use crate::context::{MessageOutbound, Outbound, Transport};
use crate::error::{Result, ServerError};
use crate::server::{ConnectionInfo, ServerInner};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tether_packet::Packet;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

pub(crate) fn router(server: Arc<ServerInner>, path: &str) -> axum::Router {
    axum::Router::new()
        .route(path, get(upgrade))
        .with_state(server)
}

async fn upgrade(
    State(server): State<Arc<ServerInner>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let max_payload = server.config.max_payload;
    ws.max_message_size(max_payload)
        .on_upgrade(move |socket| serve(server, socket, peer))
}

#[instrument(skip(server, socket))]
async fn serve(server: Arc<ServerInner>, socket: WebSocket, peer: SocketAddr) {
    let cancel = server.shutdown.child_token();
    let info = ConnectionInfo {
        node_id: Arc::from(Uuid::new_v4().to_string()),
        peer_addr: peer,
        transport: Transport::Message,
    };

    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(server.config.send_queue_size.max(1));

    // Keep quiet peers inside the read deadline.
    let keepalive = server
        .config
        .timeout
        .map(|timeout| timeout / 2)
        .filter(|period| !period.is_zero());
    let send_cancel = cancel.clone();
    let send_task = tokio::spawn(async move {
        let mut ticker =
            keepalive.map(|period| tokio::time::interval_at(Instant::now() + period, period));
        loop {
            let message = tokio::select! {
                () = send_cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                () = tick(ticker.as_mut()) => Message::Ping(Bytes::new()),
            };
            if let Err(e) = sink.send(message).await {
                trace!("WebSocket send failed: {}", e);
                break;
            }
        }
        send_cancel.cancel();
        if let Err(e) = sink.close().await {
            trace!("WebSocket close failed: {}", e);
        }
    });

    let outbound: Arc<dyn Outbound> = Arc::new(MessageOutbound::new(tx, cancel.clone(), peer));
    let read = read_loop(&server, stream, outbound, &info, &cancel);
    run_connection(&server, &info, &cancel, read).await;

    if let Err(e) = send_task.await {
        debug!("Sender for {} ended abnormally: {}", info.node_id, e);
    }
}

async fn tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn read_loop(
    server: &Arc<ServerInner>,
    mut stream: SplitStream<WebSocket>,
    outbound: Arc<dyn Outbound>,
    info: &ConnectionInfo,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = with_deadline(server.config.timeout, stream.next()) => next?,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(ServerError::WebSocket(e.to_string())),
            None => return Ok(()),
        };

        match message {
            Message::Binary(data) => {
                let packet = server.open(Packet::decode(data, server.config.max_payload)?)?;
                let ctx = server.context(
                    Arc::clone(&outbound),
                    Arc::clone(&info.node_id),
                    cancel,
                    packet,
                );
                server.spawn_dispatch(ctx);
            }
            Message::Close(frame) => {
                trace!("Peer {} sent close: {:?}", info.peer_addr, frame);
                return Ok(());
            }
            // Text and control frames only refresh the deadline.
            _ => {}
        }
    }
}
