//! # netpool
//!
//! Asynchronous, bounded TCP connection pool for a single endpoint.
//!
//! The pool creates connections on demand up to a limit, hands them out to
//! callers, takes them back on drop, probes idle ones in the background and
//! replaces connections that fail.
//!
//! ## Features
//!
//! - Configurable min/max pool sizes with FIFO queueing once saturated
//! - Connect timeout with exponential-backoff reconnection
//! - Periodic health sweep with idle timeout and pluggable liveness probe
//! - Automatic replacement of connections lost to EOF or reset
//! - Status snapshot and lifetime metrics
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use netpool::{Client, PoolConfig};
//!
//! # async fn example() -> netpool::Result<()> {
//! let config = PoolConfig::new()
//!     .host("127.0.0.1")
//!     .port(9000)
//!     .min_connections(2)
//!     .max_connections(8)
//!     .idle_timeout(Duration::from_secs(300));
//!
//! let client = Client::new(config).await?;
//! let reply = client.send_request(b"PING\r\n").await?;
//! println!("{}", String::from_utf8_lossy(&reply));
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod actor;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod pool;

pub use client::Client;
pub use config::{PoolConfig, ReconnectPolicy};
pub use connection::{Connection, ErrorSubscriber};
pub use error::{ConnectionError, PoolError, Result};
pub use lifecycle::{ConnectionId, ConnectionStatus, LivenessProbe, PeekProbe};
pub use pool::{Pool, PoolMetrics, PoolStatus, PooledConnection};
