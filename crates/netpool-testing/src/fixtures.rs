//! Test fixture utilities.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;

/// Find a local address that nothing is listening on.
///
/// Binds an ephemeral port and releases it immediately, so connecting to
/// the returned address is refused. Another process could grab the port in
/// between; tests treat that as vanishingly unlikely.
pub async fn refused_addr() -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition was observed to hold.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_refused_addr_refuses() {
        let addr = refused_addr().await.unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(30), || false).await);
        assert!(wait_until(Duration::from_millis(30), || true).await);
    }
}
