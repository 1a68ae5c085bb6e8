//! Request/response client on top of the pool.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::config::PoolConfig;
use crate::error::Result;
use crate::pool::Pool;

/// Default size of the buffer a response is read into.
pub const DEFAULT_RESPONSE_BUFFER_SIZE: usize = 1024;

/// Sends one request per borrowed connection and reads one response.
///
/// The client does no framing: a request is written in full and the
/// response is whatever a single read returns, up to the response buffer
/// size.
#[derive(Debug, Clone)]
pub struct Client {
    pool: Arc<Pool>,
    response_buffer_size: usize,
}

impl Client {
    /// Create a client with its own pool, already started.
    pub async fn new(config: PoolConfig) -> Result<Self> {
        let pool = Pool::new(config)?;
        pool.start().await?;
        Ok(Self::with_pool(Arc::new(pool)))
    }

    /// Create a client over an existing pool.
    #[must_use]
    pub fn with_pool(pool: Arc<Pool>) -> Self {
        Self {
            pool,
            response_buffer_size: DEFAULT_RESPONSE_BUFFER_SIZE,
        }
    }

    /// Set the maximum number of response bytes read per request.
    #[must_use]
    pub fn response_buffer_size(mut self, size: usize) -> Self {
        self.response_buffer_size = size;
        self
    }

    /// Write `request` and read one response.
    ///
    /// The connection goes back to the pool whether or not the exchange
    /// succeeds; a connection broken by the exchange is replaced.
    pub async fn send_request(&self, request: &[u8]) -> Result<Bytes> {
        let mut conn = self.pool.acquire().await?;
        let id = conn.id();

        conn.write(request).await?;

        let mut buf = BytesMut::zeroed(self.response_buffer_size);
        let n = conn.read_some(&mut buf).await?;
        buf.truncate(n);

        tracing::debug!(
            connection_id = %id,
            request_len = request.len(),
            response_len = n,
            "request complete"
        );

        Ok(buf.freeze())
    }

    /// The pool this client draws connections from.
    #[must_use]
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Stop the underlying pool.
    pub async fn shutdown(&self) {
        self.pool.stop().await;
    }
}
