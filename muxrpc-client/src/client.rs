//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// High-level client for muxrpc.
///
/// All methods take `&self`; share a client between tasks with `Arc` to
/// multiplex their calls over one connection. Dropping the client tears
/// the connection down.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Creates a client for `addr` with default settings.
    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self::new(ConnectionConfig::new(addr))
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Runs the client over an already established byte stream.
    pub fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.conn.attach(stream)
    }

    /// Calls `service.method` with `param` and waits for the result.
    pub async fn call(
        &self,
        signature: &str,
        param: impl Into<Bytes>,
    ) -> Result<Bytes, ClientError> {
        self.conn.call(signature, param.into()).await
    }

    /// Like [`Client::call`], giving up after `timeout`.
    pub async fn call_timeout(
        &self,
        signature: &str,
        param: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes, ClientError> {
        self.conn.call_timeout(signature, param.into(), timeout).await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Returns the number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.conn.pending_count()
    }

    /// Tears down the connection; pending calls fail with
    /// [`ClientError::ConnectionLost`].
    pub fn reset(&self) {
        self.conn.reset()
    }

    /// Closes the connection.
    pub fn close(&self) {
        tracing::debug!("Closing connection to {}", self.conn.config().addr);
        self.conn.reset()
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.conn.config()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.conn.reset();
    }
}
