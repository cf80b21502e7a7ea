//! Packet dispatch server for tether.
//!
//! A [`Router`] maps route names to handlers. A [`Server`] serves one router
//! over TCP, UDP and WebSocket at once; each inbound packet becomes a
//! [`Context`] handled on its own task, so a slow or failing handler never
//! holds up other requests on the same connection.
//!
//! ```no_run
//! use tether_server::{Context, HandlerResult, Router, Server, ServerConfig};
//!
//! async fn healthy(ctx: Context) -> HandlerResult {
//!     let name: String = ctx.parse_param()?;
//!     ctx.success(&format!("hello {name}")).await
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut router = Router::new();
//! router.handle_func("/v1/healthy", healthy)?;
//!
//! let server = Server::new(router, ServerConfig::default());
//! server.start_tcp("127.0.0.1:9000").await?;
//! server.start_websocket("127.0.0.1:9001", "/ws").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod context;
mod error;
mod router;
mod server;
mod transport;

pub use config::{DEFAULT_TIMEOUT, ServerConfig};
pub use context::{Context, HandlerResult, Transport};
pub use error::{
    Fault, Result, RouterError, STATUS_BAD_REQUEST, STATUS_INTERNAL_SERVER_ERROR,
    STATUS_NOT_FOUND, ServerError,
};
pub use router::{Handler, Middleware, Router, middleware};
pub use server::{ConnectionHook, ConnectionInfo, ErrorHook, Server, ServerBuilder};

// Re-export dependencies that are part of our public API
pub use tether_broker::{Broker, BrokerError, Callback, callback};
pub use tether_coder::{Coder, CoderRegistry};
pub use tether_packet::{Bytes, Packet, PluginChain};
