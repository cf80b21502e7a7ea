//! Accept and read loops for each transport.

pub(crate) mod tcp;
pub(crate) mod udp;
pub(crate) mod websocket;

use crate::error::{Result, ServerError, panic_message};
use crate::server::{ConnectionInfo, ServerInner};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Run a connection's read loop between the open and close hooks.
///
/// The connection token is cancelled once the loop ends, however it ends.
pub(crate) async fn run_connection<F>(
    server: &ServerInner,
    info: &ConnectionInfo,
    cancel: &CancellationToken,
    read_loop: F,
) where
    F: Future<Output = Result<()>>,
{
    server.opened(info);

    let outcome = AssertUnwindSafe(read_loop).catch_unwind().await;
    cancel.cancel();

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(ServerError::Timeout(idle))) => {
            debug!("Closing idle connection {} after {:?}", info.node_id, idle);
        }
        Ok(Err(e)) => {
            warn!("Connection {} from {} failed: {}", info.node_id, info.peer_addr, e);
            server.report(&e);
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Connection {} panicked: {}", info.node_id, message);
            server.report(&ServerError::Panicked(message));
        }
    }

    server.closed(info).await;
}

/// Await `read`, failing with [`ServerError::Timeout`] after `timeout`.
pub(crate) async fn with_deadline<T>(
    timeout: Option<Duration>,
    read: impl Future<Output = T>,
) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| ServerError::Timeout(limit)),
        None => Ok(read.await),
    }
}
