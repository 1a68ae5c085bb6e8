//! # netpool-testing
//!
//! Test infrastructure for netpool development.
//!
//! This crate provides a mock TCP server and small fixtures so pool tests
//! can run against real sockets without any external service.
//!
//! ## Features
//!
//! - Mock TCP server with echo / fixed-reply / silent / hang-up behaviors
//! - Forced disconnection of live connections
//! - Refused-address and polling helpers
//!
//! ## Mock Server Example
//!
//! ```rust,ignore
//! use netpool_testing::mock_server::{MockBehavior, MockServer};
//!
//! #[tokio::test]
//! async fn test_with_mock_server() {
//!     let server = MockServer::builder()
//!         .with_response("PONG")
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     // Point the pool at server.host() / server.port()
//!     let port = server.port();
//!     // ...
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock_server;

pub use fixtures::{refused_addr, wait_until};
pub use mock_server::{MockBehavior, MockServer, MockServerBuilder, MockServerConfig, MockServerError};
