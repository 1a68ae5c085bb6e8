//! Mock TCP server for pool testing.
//!
//! This module provides a small TCP server that pool tests can point a
//! [`netpool`](https://docs.rs/netpool) pool at without any external service.
//!
//! ## Features
//!
//! - Configurable per-connection behavior (echo, fixed reply, silent, hang up)
//! - Accepted/active connection counters
//! - Forced disconnection of every live connection, to simulate a server restart
//!
//! ## Example
//!
//! ```rust,ignore
//! use netpool_testing::mock_server::{MockBehavior, MockServer};
//!
//! #[tokio::test]
//! async fn test_echo() {
//!     let server = MockServer::builder()
//!         .with_behavior(MockBehavior::Echo)
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     let addr = server.addr();
//!     // Point your pool at addr...
//! }
//! ```

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Size of the per-connection read buffer.
const READ_BUFFER_SIZE: usize = 4096;

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// How the server treats each accepted connection.
#[derive(Debug, Clone, Default)]
pub enum MockBehavior {
    /// Write every received chunk straight back.
    #[default]
    Echo,

    /// Answer every received chunk with the same payload.
    Respond(Bytes),

    /// Read and discard; never write.
    Silent,

    /// Close the socket right after accepting it.
    CloseOnAccept,
}

/// Configuration for the mock server.
#[derive(Debug, Default, Clone)]
pub struct MockServerConfig {
    /// Per-connection behavior.
    behavior: MockBehavior,
}

/// Builder for `MockServer`.
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Create a new builder with default settings (echo server).
    pub fn new() -> Self {
        Self {
            config: MockServerConfig::default(),
        }
    }

    /// Set the per-connection behavior.
    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.config.behavior = behavior;
        self
    }

    /// Answer every request with a fixed payload.
    pub fn with_response(self, payload: impl Into<Bytes>) -> Self {
        self.with_behavior(MockBehavior::Respond(payload.into()))
    }

    /// Build and start the mock server.
    pub async fn build(self) -> Result<MockServer> {
        MockServer::start(self.config).await
    }
}

impl Default for MockServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicUsize,
    active: AtomicUsize,
    bytes_received: AtomicUsize,
}

/// A mock TCP server for testing.
///
/// Listens on an ephemeral port on `127.0.0.1`. Dropping the server stops
/// the accept loop and closes every connection it is serving.
pub struct MockServer {
    /// Server address.
    addr: SocketAddr,
    /// Stops the accept loop and every connection handler.
    shutdown_tx: broadcast::Sender<()>,
    /// Closes every live connection but keeps accepting.
    disconnect_tx: broadcast::Sender<()>,
    counters: Arc<Counters>,
}

impl MockServer {
    /// Create a new builder for the mock server.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start the mock server on an available port.
    pub async fn start(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let (disconnect_tx, _) = broadcast::channel(16);
        let counters = Arc::new(Counters::default());

        let server = Self {
            addr,
            shutdown_tx: shutdown_tx.clone(),
            disconnect_tx: disconnect_tx.clone(),
            counters: counters.clone(),
        };

        let behavior = config.behavior;
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                counters.accepted.fetch_add(1, Ordering::SeqCst);
                                let behavior = behavior.clone();
                                let counters = counters.clone();
                                let shutdown_rx = shutdown_tx.subscribe();
                                let disconnect_rx = disconnect_tx.subscribe();
                                tokio::spawn(async move {
                                    counters.active.fetch_add(1, Ordering::SeqCst);
                                    if let Err(e) = handle_connection(
                                        stream,
                                        behavior,
                                        &counters,
                                        shutdown_rx,
                                        disconnect_rx,
                                    )
                                    .await
                                    {
                                        tracing::debug!(peer = %peer_addr, "Connection error: {}", e);
                                    }
                                    counters.active.fetch_sub(1, Ordering::SeqCst);
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Ok(server)
    }

    /// Get the server's listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the host string for pool configuration.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Get the port number.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Total number of connections accepted since start.
    pub fn accepted_count(&self) -> usize {
        self.counters.accepted.load(Ordering::SeqCst)
    }

    /// Number of connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Total payload bytes received across all connections.
    pub fn bytes_received(&self) -> usize {
        self.counters.bytes_received.load(Ordering::SeqCst)
    }

    /// Close every live connection. New connections are still accepted.
    ///
    /// Clients observe an orderly shutdown (end-of-file) on their next read.
    pub fn disconnect_all(&self) {
        let _ = self.disconnect_tx.send(());
    }

    /// Stop the server.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle a single client connection.
async fn handle_connection(
    mut stream: TcpStream,
    behavior: MockBehavior,
    counters: &Counters,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut disconnect_rx: broadcast::Receiver<()>,
) -> Result<()> {
    if matches!(behavior, MockBehavior::CloseOnAccept) {
        return Ok(());
    }

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    // Client disconnected
                    break;
                }
                counters.bytes_received.fetch_add(n, Ordering::SeqCst);

                match &behavior {
                    MockBehavior::Echo => stream.write_all(&buf[..n]).await?,
                    MockBehavior::Respond(payload) => stream.write_all(payload).await?,
                    MockBehavior::Silent | MockBehavior::CloseOnAccept => {}
                }
            }
            _ = disconnect_rx.recv() => break,
            _ = shutdown_rx.recv() => break,
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn connect(server: &MockServer) -> TcpStream {
        TcpStream::connect(server.addr()).await.unwrap()
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let server = MockServer::builder().build().await.unwrap();
        let mut stream = connect(&server).await;

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"ping");
        assert_eq!(server.accepted_count(), 1);
    }

    #[tokio::test]
    async fn test_fixed_response() {
        let server = MockServer::builder()
            .with_response(Bytes::from_static(b"OK"))
            .build()
            .await
            .unwrap();
        let mut stream = connect(&server).await;

        stream.write_all(b"anything").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"OK");
    }

    #[tokio::test]
    async fn test_close_on_accept_yields_eof() {
        let server = MockServer::builder()
            .with_behavior(MockBehavior::CloseOnAccept)
            .build()
            .await
            .unwrap();
        let mut stream = connect(&server).await;

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("read should not hang")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_silent_reads_but_never_answers() {
        let server = MockServer::builder()
            .with_behavior(MockBehavior::Silent)
            .build()
            .await
            .unwrap();
        let mut stream = connect(&server).await;
        stream.write_all(b"ping").await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while server.bytes_received() < 4 {
            assert!(tokio::time::Instant::now() < deadline, "server never read");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
        assert!(read.is_err(), "silent server should not write");
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_all_closes_live_connections() {
        let server = MockServer::builder().build().await.unwrap();
        let mut stream = connect(&server).await;

        // Make sure the handler is running before asking it to hang up.
        stream.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.unwrap();

        server.disconnect_all();

        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("read should not hang")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_default_behavior_is_echo() {
        assert!(matches!(MockBehavior::default(), MockBehavior::Echo));
    }
}
