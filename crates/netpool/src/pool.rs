//! Connection pool implementation.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::actor::{Command, PoolActor, Shared};
use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::error::{PoolError, Result};
use crate::lifecycle::ConnectionId;

/// A bounded pool of TCP connections to a single endpoint.
///
/// The pool hands out idle connections, creates new ones while under
/// `max_connections`, and queues callers in FIFO order once saturated.
/// A background sweep probes idle connections and closes those idle past
/// `idle_timeout` while keeping at least `min_connections`.
///
/// All pool state is owned by one background task; the methods here
/// only exchange messages with it.
///
/// # Example
///
/// ```rust,no_run
/// use netpool::{Pool, PoolConfig};
///
/// # async fn example() -> netpool::Result<()> {
/// let pool = Pool::new(PoolConfig::new().host("127.0.0.1").port(9000))?;
/// pool.start().await?;
///
/// let mut conn = pool.acquire().await?;
/// conn.write(b"ping").await?;
/// drop(conn); // returned to the pool
///
/// pool.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Pool {
    config: Arc<PoolConfig>,
    tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("status", &self.status())
            .finish()
    }
}

impl Pool {
    /// Create a pool. Must be called from within a Tokio runtime.
    ///
    /// The pool does not connect until [`start`](Self::start) is called.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            PoolError::Configuration(format!("pool must be created inside a Tokio runtime: {e}"))
        })?;

        let config = Arc::new(config);
        let shared = Arc::new(Shared::default());
        let (tx, rx) = mpsc::unbounded_channel();

        let actor = PoolActor::new(Arc::clone(&config), rx, tx.downgrade(), Arc::clone(&shared));
        runtime.spawn(actor.run());

        tracing::debug!(host = %config.host, port = config.port, "connection pool created");

        Ok(Self { config, tx, shared })
    }

    /// Start the pool: seed `min_connections` and arm the health sweep.
    ///
    /// Idempotent while running. Connections are created in the background;
    /// this returns once they have been scheduled. Fails with
    /// [`PoolError::PoolShuttingDown`] after [`stop`](Self::stop).
    pub async fn start(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { reply })?;
        rx.await.map_err(|_| PoolError::PoolShuttingDown)?
    }

    /// Stop the pool.
    ///
    /// Fails every queued `acquire()` with [`PoolError::PoolShuttingDown`],
    /// closes idle connections and marks borrowed ones closed. Borrowed
    /// connections are closed when they are returned. Idempotent; the pool
    /// cannot be restarted.
    pub async fn stop(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Command::Stop { done: Some(done) }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Get a connection from the pool.
    ///
    /// Returns an idle connection if one exists, otherwise creates one if
    /// the pool is below `max_connections`, otherwise waits until a
    /// connection is released. There is no acquire timeout; wrap the call in
    /// [`tokio::time::timeout`] if one is needed.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        tracing::trace!("acquiring connection from pool");
        let (reply, rx) = oneshot::channel();
        self.send(Command::Acquire { reply })?;
        rx.await.map_err(|_| PoolError::PoolShuttingDown)?
    }

    /// Get an idle connection without creating or waiting.
    ///
    /// Returns `Ok(None)` if no idle connection is available.
    pub async fn try_acquire(&self) -> Result<Option<PooledConnection>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TryAcquire { reply })?;
        rx.await.map_err(|_| PoolError::PoolShuttingDown)?
    }

    /// Return a connection to the pool.
    ///
    /// Equivalent to dropping the [`PooledConnection`].
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        *self.shared.status.lock()
    }

    /// Get the pool's lifetime counters.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        *self.shared.metrics.lock()
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| PoolError::PoolShuttingDown)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Stop { done: None });
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections the pool is accountable for, including ones being
    /// created or probed.
    pub total: usize,
    /// Idle connections ready to hand out.
    pub available: usize,
    /// Connections currently borrowed.
    pub in_use: usize,
    /// Queued `acquire()` calls.
    pub waiting: usize,
    /// Maximum allowed connections.
    pub max: usize,
    /// Whether the pool is started and not stopped.
    pub running: bool,
}

impl PoolStatus {
    /// Utilization as a percentage of `max`.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }
}

/// Lifetime counters of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Connections successfully established.
    pub connections_created: u64,
    /// Connections removed from the pool and closed.
    pub connections_closed: u64,
    /// Connection attempts that failed after all retries.
    pub connections_failed: u64,
    /// Connections handed to callers.
    pub checkouts_served: u64,
    /// `acquire()` calls that had to queue.
    pub waits_queued: u64,
    /// Liveness probes run.
    pub health_checks: u64,
    /// Liveness probes that failed.
    pub health_checks_failed: u64,
}

/// A connection borrowed from a [`Pool`].
///
/// Dereferences to [`Connection`]. When dropped, the connection is returned
/// to the pool; a connection that is no longer open is discarded and
/// replaced.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: mpsc::UnboundedSender<Command>,
}

impl PooledConnection {
    pub(crate) fn new(conn: Connection, pool: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// Identifier of the underlying connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner().id()
    }

    /// Detach the connection from the pool.
    ///
    /// The pool stops tracking it and creates a replacement if it falls
    /// below `min_connections`.
    pub fn detach(mut self) -> Option<Connection> {
        let conn = self.conn.take()?;
        let _ = self.pool.send(Command::Detach { id: conn.id() });
        Some(conn)
    }

    /// Take the connection back without notifying the pool.
    pub(crate) fn reclaim(mut self) -> Option<Connection> {
        self.conn.take()
    }

    fn inner(&self) -> &Connection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }

    fn inner_mut(&mut self) -> &mut Connection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.inner()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner_mut()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::trace!(connection_id = %conn.id(), "returning connection to pool");
            // If the pool is gone the connection is dropped with the message.
            let _ = self.pool.send(Command::Release { conn });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::lifecycle::LivenessProbe;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    /// A listener that accepts and holds every connection until dropped.
    async fn holding_listener() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        (port, handle)
    }

    async fn eventually(pool: &Pool, check: impl Fn(&PoolStatus) -> bool) -> PoolStatus {
        for _ in 0..200 {
            let status = pool.status();
            if check(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached expected state: {:?}", pool.status());
    }

    fn config(port: u16) -> PoolConfig {
        PoolConfig::new().host("127.0.0.1").port(port)
    }

    /// Passes every check, but only after holding the socket for a while.
    #[derive(Debug)]
    struct SlowCheck(Duration);

    #[async_trait::async_trait]
    impl LivenessProbe for SlowCheck {
        async fn probe(&self, _stream: &mut TcpStream) -> bool {
            tokio::time::sleep(self.0).await;
            true
        }
    }

    #[test]
    fn test_pool_status_utilization() {
        let status = PoolStatus {
            total: 8,
            available: 3,
            in_use: 5,
            waiting: 0,
            max: 10,
            running: true,
        };
        assert!((status.utilization() - 50.0).abs() < f64::EPSILON);
        assert!((PoolStatus::default().utilization()).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_requires_runtime() {
        let err = Pool::new(PoolConfig::new()).unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_pool_rejects_invalid_config() {
        let err = Pool::new(PoolConfig::new().min_connections(5).max_connections(2)).unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_acquire_before_start() {
        let pool = Pool::new(config(9)).unwrap();
        assert!(matches!(pool.acquire().await, Err(PoolError::NotStarted)));
        assert!(matches!(pool.try_acquire().await, Err(PoolError::NotStarted)));
        assert!(!pool.status().running);
    }

    #[tokio::test]
    async fn test_start_seeds_min_connections() {
        let (port, _server) = holding_listener().await;
        let pool = Pool::new(config(port).min_connections(3).max_connections(5)).unwrap();
        pool.start().await.unwrap();
        pool.start().await.unwrap();

        let status = eventually(&pool, |s| s.available == 3).await;
        assert_eq!(status.total, 3);
        assert_eq!(status.in_use, 0);
        assert!(status.running);
        assert_eq!(pool.metrics().connections_created, 3);
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let (port, _server) = holding_listener().await;
        let pool = Pool::new(config(port).min_connections(1).max_connections(2)).unwrap();
        pool.start().await.unwrap();
        eventually(&pool, |s| s.available == 1).await;

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_open());
        let status = pool.status();
        assert_eq!(status.in_use, 1);
        assert_eq!(status.available, 0);

        let id = conn.id();
        pool.release(conn);
        eventually(&pool, |s| s.available == 1 && s.in_use == 0).await;

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), id);
    }

    #[tokio::test]
    async fn test_try_acquire_never_creates() {
        let (port, _server) = holding_listener().await;
        let pool = Pool::new(config(port).min_connections(0).max_connections(2)).unwrap();
        pool.start().await.unwrap();

        assert!(pool.try_acquire().await.unwrap().is_none());
        assert_eq!(pool.status().total, 0);

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        eventually(&pool, |s| s.available == 1).await;

        let conn = pool.try_acquire().await.unwrap();
        assert!(conn.is_some());
    }

    #[tokio::test]
    async fn test_detach_forgets_and_replenishes() {
        let (port, _server) = holding_listener().await;
        let pool = Pool::new(config(port).min_connections(1).max_connections(1)).unwrap();
        pool.start().await.unwrap();
        eventually(&pool, |s| s.available == 1).await;

        let conn = pool.acquire().await.unwrap();
        let detached = conn.detach().unwrap();
        assert!(detached.is_open());

        let status = eventually(&pool, |s| s.available == 1).await;
        assert_eq!(status.total, 1);

        let replacement = pool.acquire().await.unwrap();
        assert_ne!(replacement.id(), detached.id());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (port, _server) = holding_listener().await;
        let pool = Pool::new(config(port).min_connections(2)).unwrap();
        pool.start().await.unwrap();
        eventually(&pool, |s| s.available == 2).await;

        pool.stop().await;
        pool.stop().await;

        let status = pool.status();
        assert_eq!(status.total, 0);
        assert_eq!(status.available, 0);
        assert!(!status.running);
        assert!(matches!(pool.acquire().await, Err(PoolError::PoolShuttingDown)));
        assert!(matches!(pool.start().await, Err(PoolError::PoolShuttingDown)));
    }

    #[tokio::test]
    async fn test_stop_closes_borrowed_connections() {
        let (port, _server) = holding_listener().await;
        let pool = Pool::new(config(port).min_connections(1)).unwrap();
        pool.start().await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert!(conn.is_open());

        pool.stop().await;
        assert!(!conn.is_open());
        assert!(conn.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_abandoned_acquire_keeps_idle_order() {
        let (port, _server) = holding_listener().await;
        let pool = Pool::new(config(port).min_connections(2).max_connections(2)).unwrap();
        pool.start().await.unwrap();
        eventually(&pool, |s| s.available == 2).await;

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        let oldest = first.id();
        drop(first);
        drop(second);
        eventually(&pool, |s| s.available == 2).await;

        // Both requests reach the pool after their callers have gone.
        let mut gone = tokio_test::task::spawn(pool.acquire());
        assert!(gone.poll().is_pending());
        drop(gone);
        let mut gone = tokio_test::task::spawn(pool.try_acquire());
        assert!(gone.poll().is_pending());
        drop(gone);

        let next = pool.acquire().await.unwrap();
        assert_eq!(next.id(), oldest);
        assert_eq!(pool.metrics().checkouts_served, 3);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_connection_under_health_check() {
        let (port, _server) = holding_listener().await;
        let pool = Pool::new(
            config(port)
                .min_connections(1)
                .max_connections(4)
                .health_check_interval(Duration::from_millis(50))
                .probe(SlowCheck(Duration::from_millis(300))),
        )
        .unwrap();
        pool.start().await.unwrap();
        eventually(&pool, |s| s.available == 1).await;
        eventually(&pool, |s| s.total == 1 && s.available == 0 && s.in_use == 0).await;

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_open());
        assert_eq!(pool.status().total, 1);
        assert_eq!(pool.metrics().connections_created, 1);
    }

    #[tokio::test]
    async fn test_actor_exits_when_last_handle_drops_after_connection_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let pool = Pool::new(config(port).min_connections(1).max_connections(1)).unwrap();
        pool.start().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let mut buf = [0u8; 8];
        assert!(conn.read_some(&mut buf).await.unwrap_err().is_unrecoverable());

        // The loss notice is still queued when the last sender goes away, so
        // topping back up to one connection has no channel to report on.
        let shared = Arc::downgrade(&pool.shared);
        drop(conn);
        drop(pool);

        for _ in 0..200 {
            if shared.upgrade().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool actor never exited");
    }
}
