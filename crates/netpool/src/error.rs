//! Pool and connection error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by a single [`Connection`](crate::Connection).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Operation attempted on a connection that is not connected.
    #[error("connection is not connected")]
    NotConnected,

    /// `connect()` called while a connect attempt is in flight or the
    /// connection is already established.
    #[error("connection is already active")]
    AlreadyActive,

    /// Connect did not complete within its deadline.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// Resolution or TCP connect failed after all reconnect attempts.
    #[error("connect failed after {attempts} attempt(s): {source}")]
    ConnectFailed {
        /// Number of connect attempts made, including the first.
        attempts: u32,
        /// Last underlying error.
        #[source]
        source: io::Error,
    },

    /// Peer closed or reset the connection; the connection closed itself.
    #[error("connection lost: {0}")]
    Unrecoverable(#[source] io::Error),

    /// I/O error that left the connection usable.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// Reconnect backoff was abandoned because the pool shut down.
    #[error("connect cancelled by pool shutdown")]
    Cancelled,
}

impl ConnectionError {
    /// Check if the connection was torn down by this error.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_))
    }

    /// Check if the error is transient and the same operation may succeed
    /// on retry over the same connection.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Check if the error came out of the connect path.
    #[must_use]
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ConnectFailed { .. } | Self::Cancelled
        )
    }
}

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Pool has been stopped; queued and new requests fail with this.
    #[error("pool is shutting down")]
    PoolShuttingDown,

    /// `acquire()` called before `start()`.
    #[error("pool has not been started")]
    NotStarted,

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),

    /// Connection-level failure surfaced to the caller.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl PoolError {
    /// Check if this error means the pool will never serve requests again.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::PoolShuttingDown)
    }
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_classification() {
        let eof = ConnectionError::Unrecoverable(io::ErrorKind::UnexpectedEof.into());
        assert!(eof.is_unrecoverable());
        assert!(!eof.is_transient());

        let transient = ConnectionError::Io(io::ErrorKind::Interrupted.into());
        assert!(transient.is_transient());
        assert!(!transient.is_unrecoverable());

        assert!(ConnectionError::Timeout(Duration::from_secs(1)).is_connect_error());
        assert!(ConnectionError::Cancelled.is_connect_error());
        assert!(!ConnectionError::NotConnected.is_connect_error());
    }

    #[test]
    fn test_connect_failed_display() {
        let err = ConnectionError::ConnectFailed {
            attempts: 4,
            source: io::ErrorKind::ConnectionRefused.into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempt(s)"));
    }

    #[test]
    fn test_pool_error_from_connection_error() {
        let err: PoolError = ConnectionError::NotConnected.into();
        assert!(matches!(err, PoolError::Connection(ConnectionError::NotConnected)));
        assert_eq!(err.to_string(), "connection is not connected");
        assert!(!err.is_shutdown());
        assert!(PoolError::PoolShuttingDown.is_shutdown());
    }
}
