//! The task that owns all pool state.
//!
//! Every mutation of the pool's collections happens here, one command at a
//! time. Connects, probes and borrower I/O run elsewhere and report back
//! through the same command channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::error::{ConnectionError, PoolError, Result};
use crate::lifecycle::ConnectionId;
use crate::pool::{PoolMetrics, PoolStatus, PooledConnection};

/// Reply channel of a pending `acquire()`.
pub(crate) type Waiter = oneshot::Sender<Result<PooledConnection>>;

pub(crate) enum Command {
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        done: Option<oneshot::Sender<()>>,
    },
    Acquire {
        reply: Waiter,
    },
    TryAcquire {
        reply: oneshot::Sender<Result<Option<PooledConnection>>>,
    },
    Release {
        conn: Connection,
    },
    Detach {
        id: ConnectionId,
    },
    Created {
        id: ConnectionId,
        result: std::result::Result<Connection, ConnectionError>,
    },
    HealthChecked {
        conn: Connection,
        healthy: bool,
    },
    ConnectionLost {
        id: ConnectionId,
    },
}

/// Snapshot the actor publishes after every command.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) status: Mutex<PoolStatus>,
    pub(crate) metrics: Mutex<PoolMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

/// Where a tracked connection currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Available,
    InUse,
    Checking,
}

pub(crate) struct PoolActor {
    config: Arc<PoolConfig>,
    host: Arc<str>,
    rx: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::WeakUnboundedSender<Command>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    phase: Phase,
    slots: HashMap<ConnectionId, Slot>,
    available: VecDeque<Connection>,
    waiting: VecDeque<Waiter>,
    reserved: HashMap<ConnectionId, Waiter>,
    metrics: PoolMetrics,
    next_sweep: Option<Instant>,
}

impl PoolActor {
    pub(crate) fn new(
        config: Arc<PoolConfig>,
        rx: mpsc::UnboundedReceiver<Command>,
        tx: mpsc::WeakUnboundedSender<Command>,
        shared: Arc<Shared>,
    ) -> Self {
        let host: Arc<str> = Arc::from(config.host.as_str());
        Self {
            config,
            host,
            rx,
            tx,
            shared,
            shutdown: CancellationToken::new(),
            phase: Phase::Idle,
            slots: HashMap::new(),
            available: VecDeque::new(),
            waiting: VecDeque::new(),
            reserved: HashMap::new(),
            metrics: PoolMetrics::default(),
            next_sweep: None,
        }
    }

    pub(crate) async fn run(mut self) {
        self.publish();

        loop {
            let next_sweep = self.next_sweep;
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                () = sweep_timer(next_sweep) => self.sweep(),
            }
            self.publish();
        }

        self.stop();
        tracing::debug!("pool actor exiting");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Start { reply } => {
                let result = self.start();
                self.publish();
                let _ = reply.send(result);
            }
            Command::Stop { done } => {
                self.stop();
                self.publish();
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Command::Acquire { reply } => self.acquire(reply),
            Command::TryAcquire { reply } => self.try_acquire(reply),
            Command::Release { conn } => self.release(conn),
            Command::Detach { id } => self.detach(id),
            Command::Created { id, result } => self.created(id, result),
            Command::HealthChecked { conn, healthy } => self.health_checked(conn, healthy),
            Command::ConnectionLost { id } => self.connection_lost(id),
        }
    }

    fn start(&mut self) -> Result<()> {
        match self.phase {
            Phase::Running => Ok(()),
            Phase::Stopped => Err(PoolError::PoolShuttingDown),
            Phase::Idle => {
                self.phase = Phase::Running;
                tracing::info!(
                    host = %self.host,
                    port = self.config.port,
                    min_connections = self.config.min_connections,
                    max_connections = self.config.max_connections,
                    "starting connection pool"
                );
                self.ensure_min();
                self.next_sweep = Some(Instant::now() + self.config.health_check_interval);
                Ok(())
            }
        }
    }

    fn stop(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        self.phase = Phase::Stopped;
        self.next_sweep = None;
        self.shutdown.cancel();

        let waiters = self.waiting.len() + self.reserved.len();
        for waiter in self.waiting.drain(..) {
            let _ = waiter.send(Err(PoolError::PoolShuttingDown));
        }
        for (_, waiter) in self.reserved.drain() {
            let _ = waiter.send(Err(PoolError::PoolShuttingDown));
        }

        for mut conn in self.available.drain(..) {
            conn.close();
        }

        self.metrics.connections_closed += self.slots.len() as u64;
        self.slots.clear();

        tracing::info!(failed_waiters = waiters, "connection pool stopped");
    }

    fn acquire(&mut self, reply: Waiter) {
        if let Err(e) = self.check_running() {
            let _ = reply.send(Err(e));
            return;
        }

        if let Some(conn) = self.pop_available() {
            if let Some(conn) = self.lend(conn, reply) {
                self.restore(conn);
            }
            return;
        }

        // Connections out for a health check come back shortly. Queue behind
        // them before dialing a new one.
        let checking = self.count(Slot::Checking);
        if checking <= self.waiting.len() && self.slots.len() < self.config.max_connections {
            self.spawn_create(Some(reply));
            return;
        }

        self.metrics.waits_queued += 1;
        self.waiting.push_back(reply);
        tracing::debug!(
            waiting = self.waiting.len(),
            total = self.slots.len(),
            checking,
            "no idle connection, queueing acquire"
        );
    }

    fn try_acquire(&mut self, reply: oneshot::Sender<Result<Option<PooledConnection>>>) {
        if let Err(e) = self.check_running() {
            let _ = reply.send(Err(e));
            return;
        }

        let Some(conn) = self.pop_available() else {
            let _ = reply.send(Ok(None));
            return;
        };

        let lease = match self.lease(conn) {
            Ok(lease) => lease,
            Err(conn) => {
                self.restore(conn);
                let _ = reply.send(Err(PoolError::PoolShuttingDown));
                return;
            }
        };
        let id = lease.id();
        self.slots.insert(id, Slot::InUse);
        self.metrics.checkouts_served += 1;
        self.publish();

        if let Err(returned) = reply.send(Ok(Some(lease))) {
            self.metrics.checkouts_served -= 1;
            match returned.ok().flatten().and_then(PooledConnection::reclaim) {
                Some(conn) => self.restore(conn),
                None => {
                    self.slots.remove(&id);
                }
            }
        }
    }

    fn release(&mut self, mut conn: Connection) {
        let id = conn.id();
        if self.phase != Phase::Running || self.slots.get(&id) != Some(&Slot::InUse) {
            tracing::debug!(connection_id = %id, "closing released connection the pool no longer tracks");
            conn.close();
            return;
        }

        if conn.is_open() {
            tracing::trace!(connection_id = %id, "connection returned to pool");
            self.place(conn);
        } else {
            tracing::debug!(connection_id = %id, "discarding broken connection on release");
            conn.close();
            self.forget(id);
            self.rebalance();
        }
    }

    fn detach(&mut self, id: ConnectionId) {
        if self.slots.remove(&id).is_some() {
            tracing::debug!(connection_id = %id, "connection detached from pool");
            self.rebalance();
        }
    }

    fn created(&mut self, id: ConnectionId, result: std::result::Result<Connection, ConnectionError>) {
        let waiter = self.reserved.remove(&id);

        if self.phase != Phase::Running || self.slots.get(&id) != Some(&Slot::Pending) {
            if let Ok(mut conn) = result {
                conn.close();
            }
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(PoolError::PoolShuttingDown));
            }
            return;
        }

        match result {
            Ok(conn) => {
                self.metrics.connections_created += 1;
                tracing::debug!(connection_id = %id, total = self.slots.len(), "connection created");
                let conn = match waiter {
                    Some(waiter) if !waiter.is_closed() => self.lend(conn, waiter),
                    _ => Some(conn),
                };
                if let Some(conn) = conn {
                    self.place(conn);
                }
            }
            Err(err) => {
                self.slots.remove(&id);
                self.metrics.connections_failed += 1;
                tracing::warn!(connection_id = %id, error = %err, "failed to create connection");
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(err.into()));
                }
                // Replenishment to min waits for the next sweep, so a dead
                // target is not redialed in a tight loop.
                self.serve_waiters();
            }
        }
    }

    fn health_checked(&mut self, mut conn: Connection, healthy: bool) {
        let id = conn.id();
        self.metrics.health_checks += 1;
        if !healthy {
            self.metrics.health_checks_failed += 1;
        }

        if self.phase != Phase::Running || self.slots.get(&id) != Some(&Slot::Checking) {
            conn.close();
            return;
        }

        if healthy && conn.is_open() {
            self.return_checked(conn);
        } else {
            tracing::warn!(connection_id = %id, "health check failed, closing connection");
            conn.close();
            self.forget(id);
            self.rebalance();
        }
    }

    fn connection_lost(&mut self, id: ConnectionId) {
        if self.slots.contains_key(&id) {
            tracing::warn!(connection_id = %id, "connection lost");
            self.available.retain(|c| c.id() != id);
            self.forget(id);
            if self.phase == Phase::Running {
                self.rebalance();
            }
        }
    }

    fn sweep(&mut self) {
        if self.phase != Phase::Running {
            self.next_sweep = None;
            return;
        }

        let mut removable = self.slots.len().saturating_sub(self.config.min_connections);
        let idle = std::mem::take(&mut self.available);
        tracing::debug!(
            idle = idle.len(),
            total = self.slots.len(),
            "running health check sweep"
        );

        for mut conn in idle {
            let id = conn.id();
            if !conn.is_open() {
                conn.close();
                self.forget(id);
                removable = removable.saturating_sub(1);
            } else if removable > 0 && conn.idle_time() > self.config.idle_timeout {
                tracing::debug!(connection_id = %id, idle_ms = conn.idle_time().as_millis() as u64, "closing idle connection");
                conn.close();
                self.forget(id);
                removable -= 1;
            } else {
                self.spawn_probe(conn);
            }
        }

        self.rebalance();
        self.next_sweep = Some(Instant::now() + self.config.health_check_interval);
    }

    fn spawn_probe(&mut self, mut conn: Connection) {
        let Some(tx) = self.tx.upgrade() else {
            self.available.push_back(conn);
            return;
        };

        self.slots.insert(conn.id(), Slot::Checking);
        let probe = Arc::clone(&self.config.probe);
        tokio::spawn(async move {
            let healthy = conn.perform_health_check(probe.as_ref()).await;
            let _ = tx.send(Command::HealthChecked { conn, healthy });
        });
    }

    /// Reserve a slot and dial a new connection in the background.
    ///
    /// Returns `false` without reserving anything once every handle to the
    /// pool is gone.
    fn spawn_create(&mut self, waiter: Option<Waiter>) -> bool {
        let Some(tx) = self.tx.upgrade() else {
            tracing::debug!("pool handles dropped, not creating connection");
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(PoolError::PoolShuttingDown));
            }
            return false;
        };

        let mut conn = Connection::new(Arc::clone(&self.host), self.config.port)
            .with_reconnect_policy(self.config.reconnect.clone())
            .with_nodelay(self.config.tcp_nodelay)
            .with_shutdown(self.shutdown.clone());

        let lost = tx.downgrade();
        conn.set_error_callback(move |id, _err| {
            if let Some(tx) = lost.upgrade() {
                let _ = tx.send(Command::ConnectionLost { id });
            }
        });

        let id = conn.id();
        self.slots.insert(id, Slot::Pending);
        if let Some(waiter) = waiter {
            self.reserved.insert(id, waiter);
        }

        tracing::debug!(connection_id = %id, total = self.slots.len(), "creating connection");

        let timeout = self.config.connection_timeout;
        tokio::spawn(async move {
            let outcome = conn.connect(timeout).await;
            let result = outcome.map(|()| conn);
            let _ = tx.send(Command::Created { id, result });
        });
        true
    }

    /// Hand `conn` to the oldest live waiter, or park it as available.
    fn place(&mut self, conn: Connection) {
        if let Some(conn) = self.offer(conn) {
            self.slots.insert(conn.id(), Slot::Available);
            self.available.push_back(conn);
        }
    }

    /// Lend `conn` to the oldest live waiter. Returns it if nobody took it.
    fn offer(&mut self, mut conn: Connection) -> Option<Connection> {
        while let Some(waiter) = self.waiting.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            conn = self.lend(conn, waiter)?;
        }
        Some(conn)
    }

    /// Put back a connection that was popped but never lent, at the head.
    fn restore(&mut self, conn: Connection) {
        self.slots.insert(conn.id(), Slot::Available);
        self.available.push_front(conn);
    }

    /// Return a connection that passed its health check.
    ///
    /// Checks finish in any order, so an unclaimed connection is parked by
    /// last activity to keep the idle queue oldest-first.
    fn return_checked(&mut self, conn: Connection) {
        let Some(conn) = self.offer(conn) else {
            return;
        };

        let at = self
            .available
            .partition_point(|c| c.last_activity() <= conn.last_activity());
        self.slots.insert(conn.id(), Slot::Available);
        self.available.insert(at, conn);
    }

    /// Send `conn` to `waiter`. Returns the connection if the waiter is gone.
    fn lend(&mut self, conn: Connection, waiter: Waiter) -> Option<Connection> {
        let lease = match self.lease(conn) {
            Ok(lease) => lease,
            Err(conn) => return Some(conn),
        };
        let id = lease.id();
        self.slots.insert(id, Slot::InUse);
        self.metrics.checkouts_served += 1;
        self.publish();

        match waiter.send(Ok(lease)) {
            Ok(()) => None,
            Err(returned) => {
                self.metrics.checkouts_served -= 1;
                let conn = returned.ok().and_then(PooledConnection::reclaim);
                if conn.is_none() {
                    self.slots.remove(&id);
                }
                conn
            }
        }
    }

    fn lease(&self, conn: Connection) -> std::result::Result<PooledConnection, Connection> {
        match self.tx.upgrade() {
            Some(tx) => Ok(PooledConnection::new(conn, tx)),
            None => Err(conn),
        }
    }

    fn pop_available(&mut self) -> Option<Connection> {
        while let Some(mut conn) = self.available.pop_front() {
            if conn.is_open() {
                return Some(conn);
            }
            let id = conn.id();
            tracing::debug!(connection_id = %id, "discarding dead idle connection");
            conn.close();
            self.forget(id);
        }
        None
    }

    /// Start creations for queued waiters while capacity allows.
    fn serve_waiters(&mut self) {
        while self.slots.len() < self.config.max_connections {
            let Some(waiter) = self.waiting.pop_front() else {
                break;
            };
            if !waiter.is_closed() && !self.spawn_create(Some(waiter)) {
                break;
            }
        }
    }

    fn ensure_min(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        while self.slots.len() < self.config.min_connections {
            if !self.spawn_create(None) {
                break;
            }
        }
    }

    fn rebalance(&mut self) {
        self.serve_waiters();
        self.ensure_min();
    }

    fn count(&self, slot: Slot) -> usize {
        self.slots.values().filter(|s| **s == slot).count()
    }

    fn forget(&mut self, id: ConnectionId) {
        if self.slots.remove(&id).is_some() {
            self.metrics.connections_closed += 1;
        }
    }

    fn check_running(&self) -> Result<()> {
        match self.phase {
            Phase::Running => Ok(()),
            Phase::Idle => Err(PoolError::NotStarted),
            Phase::Stopped => Err(PoolError::PoolShuttingDown),
        }
    }

    fn publish(&self) {
        let in_use = self.count(Slot::InUse);
        *self.shared.status.lock() = PoolStatus {
            total: self.slots.len(),
            available: self.available.len(),
            in_use,
            waiting: self.waiting.len(),
            max: self.config.max_connections,
            running: self.phase == Phase::Running,
        };
        *self.shared.metrics.lock() = self.metrics;
    }
}

async fn sweep_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
