//! A single pooled TCP connection.
//!
//! [`Connection`] owns one socket to the pool's target and enforces the
//! connection state machine: I/O is only attempted while `Connected`,
//! connect is only attempted from `Disconnected`, and peer hang-ups tear the
//! socket down and notify the owning pool.

use std::fmt;
use std::io;
use std::net::Shutdown;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectPolicy;
use crate::error::ConnectionError;
use crate::lifecycle::{ConnectionId, ConnectionStatus, LivenessProbe};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Callback invoked when a connection closes itself after an unrecoverable
/// I/O error.
pub type ErrorSubscriber = Arc<dyn Fn(ConnectionId, &ConnectionError) + Send + Sync>;

/// Outcome of a single connect attempt.
enum AttemptError {
    Timeout,
    Io(io::Error),
}

/// One TCP connection to the pool's target.
pub struct Connection {
    id: ConnectionId,
    host: Arc<str>,
    port: u16,
    stream: Option<TcpStream>,
    status: ConnectionStatus,
    created_at: Instant,
    last_activity: Instant,
    reconnect: ReconnectPolicy,
    reconnect_attempts: u32,
    tcp_nodelay: bool,
    shutdown: CancellationToken,
    on_error: Option<ErrorSubscriber>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("status", &self.status)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a disconnected connection to `host:port`.
    pub fn new(host: impl Into<Arc<str>>, port: u16) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::next(),
            host: host.into(),
            port,
            stream: None,
            status: ConnectionStatus::Disconnected,
            created_at: now,
            last_activity: now,
            reconnect: ReconnectPolicy::default(),
            reconnect_attempts: 0,
            tcp_nodelay: true,
            shutdown: CancellationToken::new(),
            on_error: None,
        }
    }

    /// Set the reconnect policy used when `connect()` fails.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Enable or disable `TCP_NODELAY` on the socket.
    #[must_use]
    pub fn with_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Tie this connection to its owner's shutdown signal.
    #[must_use]
    pub(crate) fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Register the subscriber notified when the connection closes itself.
    pub fn set_error_callback<F>(&mut self, callback: F)
    where
        F: Fn(ConnectionId, &ConnectionError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Target host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Target port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// When the connection object was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time of the last connect, read, or write.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Time elapsed since the last connect, read, or write.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Number of reconnect attempts made by the last `connect()`.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Check whether the connection holds a live socket and is usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
            && self.status == ConnectionStatus::Connected
            && !self.shutdown.is_cancelled()
    }

    /// Connect to the target.
    ///
    /// Each attempt is bounded by `connect_timeout`. Failed attempts are
    /// retried according to the reconnect policy; the error of the final
    /// attempt is returned once retries are exhausted.
    pub async fn connect(&mut self, connect_timeout: Duration) -> Result<(), ConnectionError> {
        if self.status != ConnectionStatus::Disconnected {
            return Err(ConnectionError::AlreadyActive);
        }
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Cancelled);
        }

        self.reconnect_attempts = 0;

        loop {
            self.status = ConnectionStatus::Connecting;

            let failure = match self.try_connect(connect_timeout).await {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.status = ConnectionStatus::Connected;
                    self.touch();
                    tracing::debug!(
                        connection_id = %self.id,
                        host = %self.host,
                        port = self.port,
                        reconnects = self.reconnect_attempts,
                        "connected"
                    );
                    return Ok(());
                }
                Err(failure) => failure,
            };

            self.status = ConnectionStatus::Disconnected;

            match &failure {
                AttemptError::Timeout => tracing::warn!(
                    connection_id = %self.id,
                    host = %self.host,
                    port = self.port,
                    timeout_ms = connect_timeout.as_millis() as u64,
                    "connect timed out"
                ),
                AttemptError::Io(e) => tracing::warn!(
                    connection_id = %self.id,
                    host = %self.host,
                    port = self.port,
                    error = %e,
                    "connect failed"
                ),
            }

            if !self.reconnect.should_retry(self.reconnect_attempts) {
                return Err(match failure {
                    AttemptError::Timeout => ConnectionError::Timeout(connect_timeout),
                    AttemptError::Io(source) => ConnectionError::ConnectFailed {
                        attempts: self.reconnect_attempts + 1,
                        source,
                    },
                });
            }

            self.reconnect_attempts += 1;
            let delay = self.reconnect.backoff_for_attempt(self.reconnect_attempts);
            tracing::info!(
                connection_id = %self.id,
                attempt = self.reconnect_attempts,
                max_attempts = self.reconnect.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "attempting to reconnect"
            );

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::debug!(connection_id = %self.id, "reconnect abandoned on shutdown");
                    return Err(ConnectionError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn try_connect(&self, connect_timeout: Duration) -> Result<TcpStream, AttemptError> {
        let stream = timeout(connect_timeout, TcpStream::connect((&*self.host, self.port)))
            .await
            .map_err(|_| AttemptError::Timeout)?
            .map_err(AttemptError::Io)?;

        if self.tcp_nodelay {
            stream.set_nodelay(true).map_err(AttemptError::Io)?;
        }

        Ok(stream)
    }

    /// Write all of `data`. Returns the number of bytes written.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, ConnectionError> {
        self.ensure_connected()?;
        self.touch();

        let result = match self.stream.as_mut() {
            Some(stream) => stream.write_all(data).await,
            None => return Err(ConnectionError::NotConnected),
        };

        match result {
            Ok(()) => Ok(data.len()),
            Err(e) => Err(self.handle_io_error(e)),
        }
    }

    /// Read whatever is available into `buf`. Returns the number of bytes read.
    ///
    /// The peer closing its side is reported as an unrecoverable error, not
    /// as a zero-length read.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        self.ensure_connected()?;
        self.touch();

        let result = match self.stream.as_mut() {
            Some(stream) => stream.read(buf).await,
            None => return Err(ConnectionError::NotConnected),
        };

        match result {
            Ok(0) if !buf.is_empty() => {
                Err(self.handle_io_error(io::ErrorKind::UnexpectedEof.into()))
            }
            Ok(n) => {
                self.touch();
                Ok(n)
            }
            Err(e) => Err(self.handle_io_error(e)),
        }
    }

    /// Close the socket. Does nothing if already disconnected.
    ///
    /// Shutdown errors are logged and otherwise ignored.
    pub fn close(&mut self) {
        if self.status == ConnectionStatus::Disconnected && self.stream.is_none() {
            return;
        }

        self.status = ConnectionStatus::Closing;

        if let Some(stream) = self.stream.take() {
            match stream.into_std() {
                Ok(std_stream) => {
                    if let Err(e) = std_stream.shutdown(Shutdown::Both) {
                        if e.kind() != io::ErrorKind::NotConnected {
                            tracing::warn!(connection_id = %self.id, error = %e, "error shutting down socket");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(connection_id = %self.id, error = %e, "error closing socket");
                }
            }
        }

        self.status = ConnectionStatus::Disconnected;
        tracing::debug!(connection_id = %self.id, "connection closed");
    }

    /// Run `probe` against the socket.
    ///
    /// Returns `false` without probing unless the connection is `Connected`.
    /// A failed probe closes the connection.
    pub async fn perform_health_check(&mut self, probe: &dyn LivenessProbe) -> bool {
        if !self.is_open() {
            return false;
        }
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };

        self.status = ConnectionStatus::HealthChecking;
        let healthy = probe.probe(stream).await;
        self.status = ConnectionStatus::Connected;

        tracing::trace!(connection_id = %self.id, healthy, "health check complete");
        if !healthy {
            self.close();
        }
        healthy
    }

    fn ensure_connected(&mut self) -> Result<(), ConnectionError> {
        if self.shutdown.is_cancelled() && self.stream.is_some() {
            tracing::debug!(connection_id = %self.id, "owner shut down, closing connection");
            self.close();
        }
        if self.status != ConnectionStatus::Connected || self.stream.is_none() {
            return Err(ConnectionError::NotConnected);
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn handle_io_error(&mut self, error: io::Error) -> ConnectionError {
        match error.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => {
                tracing::warn!(connection_id = %self.id, error = %error, "connection lost");
                self.close();
                let err = ConnectionError::Unrecoverable(error);
                if let Some(callback) = &self.on_error {
                    callback(self.id, &err);
                }
                err
            }
            _ => {
                tracing::debug!(connection_id = %self.id, error = %error, "transient I/O error");
                ConnectionError::Io(error)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::lifecycle::PeekProbe;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_io_before_connect_is_rejected() {
        let mut conn = Connection::new("127.0.0.1", 9);
        let mut buf = [0u8; 4];

        assert!(matches!(conn.write(b"x").await, Err(ConnectionError::NotConnected)));
        assert!(matches!(
            conn.read_some(&mut buf).await,
            Err(ConnectionError::NotConnected)
        ));
        assert!(!conn.is_open());
        assert!(!conn.perform_health_check(&PeekProbe::default()).await);
    }

    #[tokio::test]
    async fn test_connect_write_read() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
            socket
        });

        let mut conn = Connection::new("127.0.0.1", port);
        conn.connect(Duration::from_secs(2)).await.unwrap();
        assert!(conn.is_open());
        assert_eq!(conn.status(), ConnectionStatus::Connected);

        assert_eq!(conn.write(b"hello").await.unwrap(), 5);
        let mut buf = [0u8; 16];
        let n = conn.read_some(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        let _socket = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_twice_is_already_active() {
        let (_listener, port) = listener().await;
        let mut conn = Connection::new("127.0.0.1", port);
        conn.connect(Duration::from_secs(2)).await.unwrap();

        let err = conn.connect(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::AlreadyActive));
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_listener, port) = listener().await;
        let mut conn = Connection::new("127.0.0.1", port);
        conn.connect(Duration::from_secs(2)).await.unwrap();

        conn.close();
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert!(!conn.is_open());

        conn.close();
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_ceiling_and_backoff() {
        let (listener, port) = listener().await;
        drop(listener);

        let mut conn = Connection::new("127.0.0.1", port);
        let start = Instant::now();
        let err = conn.connect(Duration::from_secs(1)).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, ConnectionError::ConnectFailed { attempts: 4, .. }));
        assert_eq!(conn.reconnect_attempts(), 3);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        // 200ms + 400ms + 800ms of backoff
        assert!(elapsed >= Duration::from_millis(1400), "elapsed: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_no_retry_fails_fast() {
        let (listener, port) = listener().await;
        drop(listener);

        let mut conn =
            Connection::new("127.0.0.1", port).with_reconnect_policy(ReconnectPolicy::no_retry());
        let err = conn.connect(Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, ConnectionError::ConnectFailed { attempts: 1, .. }));
        assert_eq!(conn.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_unanswered_handshake_times_out() {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        // Nobody accepts, so once the accept queue is full new SYNs are dropped.
        let mut backlog = Vec::new();
        while let Ok(stream) =
            tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await
        {
            backlog.push(stream.unwrap());
            assert!(backlog.len() < 64, "accept queue never filled");
        }

        let connect_timeout = Duration::from_millis(100);
        let mut conn =
            Connection::new("127.0.0.1", addr.port()).with_reconnect_policy(ReconnectPolicy::no_retry());
        let err = conn.connect(connect_timeout).await.unwrap_err();

        assert!(matches!(err, ConnectionError::Timeout(t) if t == connect_timeout));
        assert!(err.is_connect_error());
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_backoff() {
        let (listener, port) = listener().await;
        drop(listener);

        let token = CancellationToken::new();
        let mut conn = Connection::new("127.0.0.1", port).with_shutdown(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let start = Instant::now();
        let err = conn.connect(Duration::from_secs(1)).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, ConnectionError::Cancelled));
        assert!(start.elapsed() < Duration::from_millis(1400));
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_and_notifies() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let seen: Arc<Mutex<Vec<ConnectionId>>> = Arc::default();
        let mut conn = Connection::new("127.0.0.1", port);
        let sink = seen.clone();
        conn.set_error_callback(move |id, err| {
            assert!(err.is_unrecoverable());
            sink.lock().unwrap().push(id);
        });

        conn.connect(Duration::from_secs(2)).await.unwrap();
        server.await.unwrap();

        let mut buf = [0u8; 8];
        let err = conn.read_some(&mut buf).await.unwrap_err();

        assert!(err.is_unrecoverable());
        assert!(!conn.is_open());
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert_eq!(seen.lock().unwrap().as_slice(), &[conn.id()]);
    }

    #[tokio::test]
    async fn test_transient_io_error_keeps_connection() {
        let (listener, port) = listener().await;
        let seen: Arc<Mutex<Vec<ConnectionId>>> = Arc::default();
        let mut conn = Connection::new("127.0.0.1", port);
        let sink = seen.clone();
        conn.set_error_callback(move |id, _| sink.lock().unwrap().push(id));

        conn.connect(Duration::from_secs(2)).await.unwrap();
        let (_peer, _) = listener.accept().await.unwrap();

        let err = conn.handle_io_error(io::ErrorKind::TimedOut.into());

        assert!(err.is_transient());
        assert!(!err.is_unrecoverable());
        assert!(conn.is_open());
        assert_eq!(conn.status(), ConnectionStatus::Connected);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_owner_makes_connection_unusable() {
        let (_listener, port) = listener().await;
        let token = CancellationToken::new();
        let mut conn = Connection::new("127.0.0.1", port).with_shutdown(token.clone());
        conn.connect(Duration::from_secs(2)).await.unwrap();
        assert!(conn.is_open());

        token.cancel();
        assert!(!conn.is_open());
        assert!(matches!(conn.write(b"x").await, Err(ConnectionError::NotConnected)));
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_health_check_restores_connected() {
        let (listener, port) = listener().await;
        let mut conn = Connection::new("127.0.0.1", port);
        conn.connect(Duration::from_secs(2)).await.unwrap();
        let (_server_side, _) = listener.accept().await.unwrap();

        assert!(conn.perform_health_check(&PeekProbe::default()).await);
        assert_eq!(conn.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_failed_health_check_closes() {
        let (listener, port) = listener().await;
        let mut conn = Connection::new("127.0.0.1", port);
        conn.connect(Duration::from_secs(2)).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        drop(server_side);

        let probe = PeekProbe::new(Duration::from_secs(1));
        assert!(!conn.perform_health_check(&probe).await);
        assert!(!conn.is_open());
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = Connection::new("h", 1);
        let b = Connection::new("h", 1);
        assert_ne!(a.id(), b.id());
    }
}
