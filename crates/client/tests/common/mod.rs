#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tether_server::{Context, Fault, HandlerResult, Router, Server, ServerConfig};

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
pub struct Add {
    pub a: i64,
    pub b: i64,
}

async fn healthy(ctx: Context) -> HandlerResult {
    let echo: serde_json::Value = ctx.parse_param()?;
    ctx.success(&echo).await
}

async fn add(ctx: Context) -> HandlerResult {
    let Add { a, b } = ctx.parse_param()?;
    ctx.success(&(a + b)).await
}

async fn fail(_ctx: Context) -> HandlerResult {
    Err(Fault::from("boom"))
}

async fn sleep(ctx: Context) -> HandlerResult {
    tokio::time::sleep(Duration::from_secs(2)).await;
    ctx.success("late").await
}

async fn broadcast(ctx: Context) -> HandlerResult {
    ctx.publish_raw("topic", ctx.body().clone()).await
}

async fn panic(_ctx: Context) -> HandlerResult {
    panic!("handler blew up");
}

async fn whoami(ctx: Context) -> HandlerResult {
    let user = ctx.request_property("user").unwrap_or_default();
    ctx.success(&user).await
}

pub fn router() -> Router {
    let _ = tracing_subscriber::fmt::try_init();

    let mut router = Router::new();
    router
        .handle_func("/v1/healthy", healthy)
        .unwrap()
        .handle_func("/v1/add", add)
        .unwrap()
        .handle_func("/v1/fail", fail)
        .unwrap()
        .handle_func("/v1/sleep", sleep)
        .unwrap()
        .handle_func("/v1/broadcast", broadcast)
        .unwrap()
        .handle_func("/v1/whoami", whoami)
        .unwrap()
        .handle_func("/v1/panic", panic)
        .unwrap();
    router
}

pub struct Endpoints {
    pub server: Server,
    pub tcp: SocketAddr,
    pub udp: SocketAddr,
    pub websocket: SocketAddr,
}

pub async fn serve(config: ServerConfig) -> Endpoints {
    start(Server::new(router(), config)).await
}

pub async fn start(server: Server) -> Endpoints {
    let tcp = server.start_tcp("127.0.0.1:0").await.unwrap();
    let udp = server.start_udp("127.0.0.1:0").await.unwrap();
    let websocket = server.start_websocket("127.0.0.1:0", "/ws").await.unwrap();
    Endpoints {
        server,
        tcp,
        udp,
        websocket,
    }
}

/// An address that accepts TCP connections but never says a word.
pub async fn silent_address() -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    (addr.to_string(), task)
}

/// An address nothing listens on.
pub async fn dead_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}
