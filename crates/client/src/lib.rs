//! Client side of tether.
//!
//! A [`Session`] is one connection over TCP, UDP or WebSocket that carries any
//! number of concurrent requests, plus standing listeners for topics the
//! server pushes. A [`Pool`] keeps several sessions open across a set of
//! equivalent servers and fails over between them.
//!
//! ```no_run
//! use std::time::Duration;
//! use tether_client::{Network, Session, SessionConfig};
//!
//! # async fn run() -> Result<(), tether_client::ClientError> {
//! let session = Session::connect(Network::Tcp, "127.0.0.1:9000", SessionConfig::default()).await?;
//! let greeting: String = session
//!     .call("/v1/healthy", "tether", Duration::from_secs(3))
//!     .await?;
//! session.close();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod callback;
mod config;
mod error;
mod pool;
mod session;
mod transport;

pub use callback::{RequestStatusCallback, Response};
pub use config::{
    AddressHook, DEFAULT_DIAL_TIMEOUT, DEFAULT_PING_INTERVAL, Network, PoolConfig, PoolErrorHook,
    SessionConfig, SessionErrorHook,
};
pub use error::{ClientError, PoolError, Result};
pub use pool::{Pool, PooledSession};
pub use session::{ReadyState, Session};

// Re-export dependencies that are part of our public API
pub use tether_packet::{Bytes, HeaderBag, PluginChain};
