//! Connection management and call multiplexing.

use crate::error::ClientError;
use bytes::Bytes;
use muxrpc_protocol::{Call, Decoder, Encoder};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default capacity of the outbound call queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Maximum capacity of the outbound call queue.
pub const MAX_QUEUE_CAPACITY: usize = 4096;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address (`host:port`).
    pub addr: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Timeout applied to every `call` (None = wait indefinitely).
    pub call_timeout: Option<Duration>,
    /// Capacity of the outbound queue; a full queue suspends callers.
    pub queue_capacity: usize,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
            call_timeout: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.clamp(1, MAX_QUEUE_CAPACITY);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

type Delivery = oneshot::Sender<Result<Bytes, ClientError>>;

/// State guarded by the connection lock.
struct Shared {
    /// Bumped on every (re)connect so that teardown of an old connection
    /// never touches a newer one.
    generation: u64,
    /// Sender side of the outbound queue; `None` while disconnected.
    outbound: Option<mpsc::Sender<Call>>,
    /// In-flight calls keyed by request id.
    pending: HashMap<i64, Delivery>,
    /// Writer and reader tasks of the live connection.
    tasks: Vec<JoinHandle<()>>,
}

/// A multiplexed connection to a muxrpc server.
pub struct Connection {
    config: ConnectionConfig,
    shared: Mutex<Shared>,
    /// Last request id handed out.
    next_id: AtomicI64,
}

/// Removes an in-flight entry when its call future is dropped early.
struct PendingGuard<'a> {
    conn: &'a Connection,
    id: i64,
    generation: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut shared = self.conn.shared.lock();
        if shared.generation == self.generation && shared.pending.remove(&self.id).is_some() {
            tracing::debug!("Call id={} abandoned before its response arrived", self.id);
        }
    }
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            shared: Mutex::new(Shared {
                generation: 0,
                outbound: None,
                pending: HashMap::new(),
                tasks: Vec::new(),
            }),
            next_id: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connects to the server and starts the writer and reader tasks.
    ///
    /// Any previous connection is torn down first.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);

        let tcp_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr.as_str()),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;

        // Configure TCP options for better latency
        tcp_stream.set_nodelay(true).ok();

        let (read_half, write_half) = tcp_stream.into_split();
        self.start(read_half, write_half);
        tracing::debug!("Connected to {}", self.config.addr);
        Ok(())
    }

    /// Runs the connection over an already established byte stream.
    pub fn attach<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        self.start(read_half, write_half);
    }

    fn start<R, W>(self: &Arc<Self>, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);

        let mut shared = self.shared.lock();
        if shared.outbound.is_some() {
            self.teardown_locked(&mut shared);
        }
        shared.generation += 1;
        let generation = shared.generation;
        shared.outbound = Some(tx);

        let write_task = tokio::spawn(self.clone().write_loop(writer, rx, generation));
        let read_task = tokio::spawn(self.clone().read_loop(reader, generation));
        shared.tasks = vec![write_task, read_task];
    }

    /// Sends a call and waits for its response.
    ///
    /// Applies the configured call timeout, if any.
    pub async fn call(&self, signature: &str, param: Bytes) -> Result<Bytes, ClientError> {
        match self.config.call_timeout {
            Some(timeout) => self.call_timeout(signature, param, timeout).await,
            None => self.call_inner(signature, param).await,
        }
    }

    /// Sends a call and waits at most `timeout` for its response.
    pub async fn call_timeout(
        &self,
        signature: &str,
        param: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, ClientError> {
        tokio::time::timeout(timeout, self.call_inner(signature, param))
            .await
            .map_err(|_| {
                tracing::debug!("Call {} timed out after {:?}", signature, timeout);
                ClientError::Timeout
            })?
    }

    async fn call_inner(&self, signature: &str, param: Bytes) -> Result<Bytes, ClientError> {
        let mut call = Call::from_signature(0, signature, param)?;
        let (tx, rx) = oneshot::channel();

        let (outbound, generation) = {
            let mut shared = self.shared.lock();
            let outbound = shared.outbound.clone().ok_or(ClientError::NotConnected)?;
            call.id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            shared.pending.insert(call.id, tx);
            (outbound, shared.generation)
        };

        let mut guard = PendingGuard {
            conn: self,
            id: call.id,
            generation,
            armed: true,
        };
        tracing::debug!("Queueing call id={} {}", call.id, signature);

        if outbound.send(call).await.is_err() {
            return Err(ClientError::ConnectionLost);
        }

        let outcome = rx.await.map_err(|_| ClientError::ConnectionLost)?;
        guard.armed = false;
        outcome
    }

    async fn write_loop<W>(self: Arc<Self>, writer: W, mut rx: mpsc::Receiver<Call>, generation: u64)
    where
        W: AsyncWrite + Unpin,
    {
        let mut writer = BufWriter::new(writer);
        match self.write_calls(&mut writer, &mut rx).await {
            Ok(()) => tracing::debug!("write_loop: outbound queue closed"),
            Err(e) => tracing::debug!("write_loop: {}", e),
        }
        self.teardown(generation);
    }

    async fn write_calls<W>(
        &self,
        writer: &mut BufWriter<W>,
        rx: &mut mpsc::Receiver<Call>,
    ) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(call) = rx.recv().await {
            self.write_call(writer, call).await?;

            // Drain the burst before paying for a flush.
            while let Ok(call) = rx.try_recv() {
                self.write_call(writer, call).await?;
            }
            writer.flush().await?;
        }
        Ok(())
    }

    async fn write_call<W>(&self, writer: &mut BufWriter<W>, call: Call) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        match Encoder::encode_call(&call) {
            Ok(frame) => {
                writer.write_all(&frame).await?;
                tracing::debug!("write_loop: sent call id={} ({} bytes)", call.id, frame.len());
            }
            Err(e) => {
                tracing::debug!("write_loop: cannot encode call id={}: {}", call.id, e);
                self.deliver(call.id, Err(ClientError::Protocol(e)));
            }
        }
        Ok(())
    }

    async fn read_loop<R>(self: Arc<Self>, reader: R, generation: u64)
    where
        R: AsyncRead + Unpin,
    {
        if let Err(e) = self.read_responses(reader).await {
            tracing::debug!("read_loop: {}", e);
        }
        self.teardown(generation);
    }

    async fn read_responses<R>(&self, mut reader: R) -> Result<(), ClientError>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = Decoder::with_capacity(self.config.read_buffer_size);
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                if decoder.has_partial_frame() {
                    return Err(ClientError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    )));
                }
                return Err(ClientError::ConnectionClosed);
            }

            decoder.extend(&buf[..n]);
            while let Some(response) = decoder.decode_response()? {
                tracing::debug!("read_loop: response id={}", response.id);
                self.deliver(response.id, response.outcome.map_err(ClientError::Remote));
            }
        }
    }

    /// Hands an outcome to the call waiting on `id`, removing its entry.
    fn deliver(&self, id: i64, outcome: Result<Bytes, ClientError>) {
        let delivery = self.shared.lock().pending.remove(&id);
        match delivery {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => tracing::debug!("No pending call for id={}, discarding response", id),
        }
    }

    fn teardown(&self, generation: u64) {
        let mut shared = self.shared.lock();
        if shared.generation == generation {
            self.teardown_locked(&mut shared);
        }
    }

    /// Stops both tasks, closing the stream, and fails every in-flight call.
    fn teardown_locked(&self, shared: &mut Shared) {
        let was_connected = shared.outbound.take().is_some();
        for task in shared.tasks.drain(..) {
            task.abort();
        }

        let abandoned = shared.pending.len();
        for (_, tx) in shared.pending.drain() {
            let _ = tx.send(Err(ClientError::ConnectionLost));
        }
        self.next_id.store(0, Ordering::SeqCst);

        if was_connected || abandoned > 0 {
            tracing::debug!(
                "Connection to {} torn down, {} pending call(s) failed",
                self.config.addr,
                abandoned
            );
        }
    }

    /// Tears down the connection and clears all in-flight state.
    pub fn reset(&self) {
        let mut shared = self.shared.lock();
        self.teardown_locked(&mut shared);
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.shared.lock().outbound.is_some()
    }

    /// Returns the number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }
}
