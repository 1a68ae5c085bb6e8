//! Pool configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::error::PoolError;
use crate::lifecycle::{LivenessProbe, PeekProbe};

/// Default target host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default target port.
pub const DEFAULT_PORT: u16 = 8080;

/// Reconnection policy applied when a connection's first connect fails.
///
/// Retry `n` (1-based) waits `base_delay * 2^n`, capped at `max_delay`.
/// With the defaults that is 200ms, 400ms, 800ms before giving up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of retries after the first attempt (default: 3).
    pub max_attempts: u32,
    /// Backoff unit (default: 100ms).
    pub base_delay: Duration,
    /// Upper bound on any single backoff (default: 30s).
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Create a new reconnect policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of retries.
    #[must_use]
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the backoff unit.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum backoff.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Disable reconnection: the first connect failure is final.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Calculate the delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Check if another retry is allowed after `attempts` retries.
    #[must_use]
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Configuration for the connection pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Remote host name or IP address.
    pub host: String,

    /// Remote port.
    pub port: u16,

    /// Minimum number of connections to maintain while running.
    pub min_connections: usize,

    /// Maximum number of connections allowed.
    pub max_connections: usize,

    /// Deadline for a single TCP connect attempt.
    pub connection_timeout: Duration,

    /// Time a connection can sit idle before the health sweep may close it.
    pub idle_timeout: Duration,

    /// Interval between health-check sweeps of idle connections.
    pub health_check_interval: Duration,

    /// Backoff policy for failed connects.
    pub reconnect: ReconnectPolicy,

    /// Whether to set `TCP_NODELAY` on new sockets.
    pub tcp_nodelay: bool,

    /// Liveness probe used by the health sweep.
    pub probe: Arc<dyn LivenessProbe>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            min_connections: 2,
            max_connections: 10,
            connection_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            tcp_nodelay: true,
            probe: Arc::new(PeekProbe::default()),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the target port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: usize) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the per-attempt connect timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the health check interval.
    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Enable or disable `TCP_NODELAY`.
    #[must_use]
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set a custom liveness probe.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use netpool::{PeekProbe, PoolConfig};
    ///
    /// let config = PoolConfig::new()
    ///     .probe(PeekProbe::new(Duration::from_millis(50)));
    /// ```
    #[must_use]
    pub fn probe(mut self, probe: impl LivenessProbe + 'static) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// Parse a configuration from a `key=value;` string.
    ///
    /// Keys are case-insensitive. Timeouts are in whole seconds.
    ///
    /// ```rust
    /// use netpool::PoolConfig;
    ///
    /// let config = PoolConfig::from_connection_string(
    ///     "Host=10.0.0.5;Port=9000;Min Connections=1;Max Connections=4",
    /// ).unwrap();
    /// assert_eq!(config.port, 9000);
    /// assert_eq!(config.max_connections, 4);
    /// ```
    pub fn from_connection_string(conn_str: &str) -> Result<Self, PoolError> {
        let mut config = Self::default();

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PoolError::Configuration(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "host" | "server" | "address" => {
                    // Handle host,port and host:port forms
                    if let Some((host, port)) =
                        value.split_once(',').or_else(|| value.rsplit_once(':'))
                    {
                        config.host = host.trim().to_string();
                        config.port = parse_port(port.trim())?;
                    } else {
                        config.host = value.to_string();
                    }
                }
                "port" => {
                    config.port = parse_port(value)?;
                }
                "min connections" | "min pool size" => {
                    config.min_connections = parse_count(value)?;
                }
                "max connections" | "max pool size" => {
                    config.max_connections = parse_count(value)?;
                }
                "connect timeout" | "connection timeout" => {
                    config.connection_timeout = parse_secs(value)?;
                }
                "idle timeout" => {
                    config.idle_timeout = parse_secs(value)?;
                }
                "health check interval" => {
                    config.health_check_interval = parse_secs(value)?;
                }
                "max reconnect attempts" => {
                    config.reconnect.max_attempts = value.parse().map_err(|_| {
                        PoolError::Configuration(format!("invalid attempt count: {value}"))
                    })?;
                }
                "tcp nodelay" | "tcpnodelay" => {
                    config.tcp_nodelay = parse_bool(value)?;
                }
                _ => {
                    tracing::debug!(key = %key, "ignoring unknown connection string key");
                }
            }
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.host.is_empty() {
            return Err(PoolError::Configuration("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(PoolError::Configuration("port must not be 0".into()));
        }
        if self.max_connections == 0 {
            return Err(PoolError::Configuration(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::Configuration(
                "min_connections cannot be greater than max_connections".into(),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(PoolError::Configuration(
                "health_check_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn parse_port(value: &str) -> Result<u16, PoolError> {
    value
        .parse()
        .map_err(|_| PoolError::Configuration(format!("invalid port: {value}")))
}

fn parse_count(value: &str) -> Result<usize, PoolError> {
    value
        .parse()
        .map_err(|_| PoolError::Configuration(format!("invalid connection count: {value}")))
}

fn parse_secs(value: &str) -> Result<Duration, PoolError> {
    let secs: u64 = value
        .parse()
        .map_err(|_| PoolError::Configuration(format!("invalid timeout: {value}")))?;
    Ok(Duration::from_secs(secs))
}

fn parse_bool(value: &str) -> Result<bool, PoolError> {
    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1" {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") || value.eq_ignore_ascii_case("no") || value == "0"
    {
        Ok(false)
    } else {
        Err(PoolError::Configuration(format!("invalid boolean: {value}")))
    }
}
