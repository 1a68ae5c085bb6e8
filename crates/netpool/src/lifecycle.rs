//! Connection lifecycle management.
//!
//! This module defines the connection state machine, the identifiers the
//! pool uses to track connections, and the liveness probe seam used by the
//! health-check sweep.

use std::fmt;
use std::time::Duration;

use tokio::net::TcpStream;

/// Stable, pool-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    /// Raw numeric value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state.
///
/// ```text
/// Disconnected -> Connecting -> Connected | Disconnected
/// Connected -> HealthChecking -> Connected
/// Connected -> Closing -> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No socket. Initial state, and terminal after close.
    #[default]
    Disconnected,
    /// Connect attempt in flight.
    Connecting,
    /// Socket established and usable.
    Connected,
    /// Socket being shut down.
    Closing,
    /// Liveness probe in flight.
    HealthChecking,
}

impl ConnectionStatus {
    /// Check if the connection can carry I/O.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if an operation is in progress that excludes a new connect.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Connecting | Self::Closing | Self::HealthChecking)
    }
}

/// Liveness probe run against idle connections by the health sweep.
///
/// Implementations get exclusive access to the socket for the duration of
/// the probe and may exchange an application-level ping. Returning `false`
/// closes the connection and triggers replenishment.
#[async_trait::async_trait]
pub trait LivenessProbe: Send + Sync + fmt::Debug {
    /// Check whether the peer is still there.
    async fn probe(&self, stream: &mut TcpStream) -> bool;
}

/// Default probe: a one-byte peek bounded by a short window.
///
/// An idle, healthy socket has nothing to read, so the window elapsing is
/// treated as alive. A zero-byte peek means the peer closed its side.
#[derive(Debug, Clone)]
pub struct PeekProbe {
    window: Duration,
}

impl PeekProbe {
    /// Default peek window.
    pub const DEFAULT_WINDOW: Duration = Duration::from_millis(25);

    /// Create a probe with a custom peek window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self { window }
    }
}

impl Default for PeekProbe {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

#[async_trait::async_trait]
impl LivenessProbe for PeekProbe {
    async fn probe(&self, stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 1];
        match tokio::time::timeout(self.window, stream.peek(&mut buf)).await {
            Err(_elapsed) => true,
            Ok(Ok(0)) => false,
            Ok(Ok(_)) => {
                tracing::debug!("unread data pending on idle connection");
                true
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "liveness peek failed");
                false
            }
        }
    }
}
