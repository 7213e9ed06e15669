//! TCP server implementation.

use crate::config::OverloadPolicy;
use crate::error::ServerError;
use crate::handler::{Callback, Handler, Outgoing};
use crate::registry::ServiceRegistry;
use muxrpc_protocol::{Call, Decoder, Encoder, Response};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;

/// Error message answered when a call is rejected by the overload policy.
pub const OVERLOADED_MESSAGE: &str = "server overloaded";

/// Replies synthesized by the server (unknown service, overload) that may
/// wait in one connection's response queue at once.
pub const MAX_QUEUED_REPLIES: usize = 64;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address bound by [`Server::run`].
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum calls handled at once per connection (0 = unlimited).
    pub max_in_flight_calls: usize,
    /// What to do with a call once `max_in_flight_calls` is reached.
    pub overload_policy: OverloadPolicy,
    /// Size of the per-connection socket read buffer.
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], muxrpc_protocol::DEFAULT_PORT)),
            max_connections: 1000,
            max_in_flight_calls: 1024,
            overload_policy: OverloadPolicy::Wait,
            read_buffer_size: 8 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_max_in_flight_calls(mut self, max: usize) -> Self {
        self.max_in_flight_calls = max;
        self
    }

    pub fn with_overload_policy(mut self, policy: OverloadPolicy) -> Self {
        self.overload_policy = policy;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub calls_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub rejected_total: AtomicU64,
}

/// TCP server dispatching calls to registered services.
pub struct Server {
    config: ServerConfig,
    registry: Arc<ServiceRegistry>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server with an empty registry.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry: Arc::new(ServiceRegistry::new()),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registers `handler` under `service`, returning the handler it
    /// replaced. Takes effect for calls decoded after it returns, on
    /// every connection.
    pub fn register<H: Handler>(
        &self,
        service: impl Into<String>,
        handler: H,
    ) -> Result<Option<Arc<dyn Handler>>, ServerError> {
        self.registry.register(service, handler)
    }

    /// Removes the handler registered under `service`.
    pub fn unregister(&self, service: &str) -> Option<Arc<dyn Handler>> {
        self.registry.unregister(service)
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.listen_and_serve(self.config.bind_addr).await
    }

    /// Binds `addr` and serves until shutdown. Returns immediately if the
    /// bind fails.
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", local_addr);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            if let Err(e) = tcp_stream.set_nodelay(true) {
                                tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
                            }
                            self.spawn_connection(tcp_stream, addr.to_string());
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                            // Avoid spinning on persistent errors such as EMFILE.
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Serves a single connection over an already established byte stream.
    ///
    /// The returned handle completes when the connection ends.
    pub fn serve_stream<S>(&self, stream: S, peer: impl Into<String>) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.spawn_connection(stream, peer.into())
    }

    fn spawn_connection<S>(&self, stream: S, peer: String) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let registry = self.registry.clone();
        let stats = self.stats.clone();
        let config = self.config.clone();
        let mut conn_shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            tracing::info!("Client connected: {}", peer);

            let result = Self::handle_connection(
                stream,
                peer.clone(),
                registry,
                stats.clone(),
                config,
                &mut conn_shutdown,
            )
            .await;

            match result {
                Ok(()) | Err(ServerError::ShuttingDown) => {}
                Err(e) => {
                    tracing::warn!("[{}] Connection error: {}", peer, e);
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            tracing::info!("Client disconnected: {}", peer);
        })
    }

    /// Runs the reader/dispatcher of one connection and its writer task.
    async fn handle_connection<S>(
        stream: S,
        peer: String,
        registry: Arc<ServiceRegistry>,
        stats: Arc<ServerStats>,
        config: ServerConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let mut writer_task = tokio::spawn(write_loop(writer, response_rx, peer.clone()));

        let dispatcher = Dispatcher {
            peer,
            registry,
            stats,
            limiter: (config.max_in_flight_calls > 0)
                .then(|| Arc::new(Semaphore::new(config.max_in_flight_calls))),
            overload_policy: config.overload_policy,
            replies: Arc::new(Semaphore::new(MAX_QUEUED_REPLIES)),
            responses: response_tx,
        };

        let result = dispatcher
            .read_calls(
                &mut reader,
                &mut writer_task,
                config.read_buffer_size.max(1),
                shutdown,
            )
            .await;

        // Responses still owed by running handlers are discarded.
        writer_task.abort();
        result
    }

    /// Initiates server shutdown: stops the accept loop and closes every
    /// connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

/// Per-connection call dispatch state.
struct Dispatcher {
    peer: String,
    registry: Arc<ServiceRegistry>,
    stats: Arc<ServerStats>,
    limiter: Option<Arc<Semaphore>>,
    overload_policy: OverloadPolicy,
    /// Queue slots for synthesized replies; exhausted while the writer is stalled.
    replies: Arc<Semaphore>,
    responses: mpsc::UnboundedSender<Outgoing>,
}

impl Dispatcher {
    async fn read_calls<R>(
        &self,
        reader: &mut R,
        writer_task: &mut JoinHandle<Result<(), ServerError>>,
        read_buffer_size: usize,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = Decoder::with_capacity(read_buffer_size);
        let mut buf = vec![0u8; read_buffer_size];

        loop {
            tokio::select! {
                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            if decoder.has_partial_frame() {
                                tracing::debug!("[{}] Connection closed mid-frame", self.peer);
                                return Err(ServerError::Io(std::io::Error::new(
                                    std::io::ErrorKind::UnexpectedEof,
                                    "connection closed mid-frame",
                                )));
                            }
                            tracing::debug!("[{}] Connection closed by client", self.peer);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::trace!("[{}] Received {} bytes", self.peer, n);
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", self.peer, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                joined = &mut *writer_task => {
                    tracing::debug!("[{}] Writer stopped", self.peer);
                    return match joined {
                        Ok(result) => result,
                        Err(e) => Err(ServerError::Io(e.into())),
                    };
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", self.peer);
                    return Err(ServerError::ShuttingDown);
                }
            }

            while let Some(call) = decoder.decode_call()? {
                self.dispatch(call, shutdown).await?;
            }
        }
    }

    /// Routes one call to its handler. Waits only for an in-flight permit.
    async fn dispatch(
        &self,
        call: Call,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        self.stats.calls_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "[{}] Call {}.{} (id={})",
            self.peer,
            call.service,
            call.method,
            call.id
        );

        let Some(handler) = self.registry.lookup(&call.service) else {
            tracing::debug!("[{}] No such service: {}", self.peer, call.service);
            return self
                .reply(
                    Response::failure(call.id, format!("no such service: {}", call.service)),
                    shutdown,
                )
                .await;
        };

        let permit = match &self.limiter {
            None => None,
            Some(limiter) => match self.overload_policy {
                OverloadPolicy::Reject => match limiter.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        tracing::debug!("[{}] Overloaded, rejecting id={}", self.peer, call.id);
                        self.stats.rejected_total.fetch_add(1, Ordering::Relaxed);
                        return self
                            .reply(Response::failure(call.id, OVERLOADED_MESSAGE), shutdown)
                            .await;
                    }
                },
                OverloadPolicy::Wait => {
                    tokio::select! {
                        permit = limiter.clone().acquire_owned() => {
                            Some(permit.map_err(|_| ServerError::ShuttingDown)?)
                        }
                        _ = shutdown.recv() => return Err(ServerError::ShuttingDown),
                    }
                }
            },
        };

        let Call {
            id, method, param, ..
        } = call;
        let callback = Callback::new(id, self.responses.clone(), permit);
        tokio::spawn(async move {
            handler.handle(method, param, callback);
        });
        Ok(())
    }

    /// Queues a reply that no handler produced. Waits for a free reply slot,
    /// so a peer that never reads eventually stops being read from.
    async fn reply(
        &self,
        response: Response,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let permit = tokio::select! {
            permit = self.replies.clone().acquire_owned() => {
                permit.map_err(|_| ServerError::ShuttingDown)?
            }
            _ = shutdown.recv() => return Err(ServerError::ShuttingDown),
        };

        let id = response.id;
        let outgoing = Outgoing {
            response,
            permit: Some(permit),
        };
        if self.responses.send(outgoing).is_err() {
            tracing::debug!("[{}] Writer gone, dropping response id={}", self.peer, id);
        }
        Ok(())
    }
}

/// Drains the response queue onto the socket, flushing whenever the queue
/// is momentarily empty.
async fn write_loop<W>(
    writer: W,
    mut responses: mpsc::UnboundedReceiver<Outgoing>,
    peer: String,
) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    while let Some(outgoing) = responses.recv().await {
        write_response(&mut writer, outgoing, &peer).await?;
        while let Ok(outgoing) = responses.try_recv() {
            write_response(&mut writer, outgoing, &peer).await?;
        }
        writer.flush().await?;
    }

    Ok(())
}

async fn write_response<W>(
    writer: &mut BufWriter<W>,
    outgoing: Outgoing,
    peer: &str,
) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let Outgoing { response, permit } = outgoing;
    drop(permit);

    let bytes = match Encoder::encode_response(&response) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(
                "[{}] Response id={} could not be encoded: {}",
                peer,
                response.id,
                e
            );
            Encoder::encode_response(&Response::failure(
                response.id,
                format!("unencodable response: {}", e),
            ))?
        }
    };

    tracing::debug!(
        "[{}] Response: {} (id={})",
        peer,
        if response.is_ok() { "OK" } else { "ERROR" },
        response.id
    );
    writer.write_all(&bytes).await?;
    Ok(())
}
