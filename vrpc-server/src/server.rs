//! Accept loop and handler registration.

use crate::conn::Conn;
use crate::error::ServerError;
use crate::handler::{Handler, HandlerError, HandlerRegistry};
use crate::metrics::ServerMetrics;
use crate::stream::ServerStream;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_vsock::{VsockAddr, VsockListener};
use vrpc_protocol::Address;

/// Server configuration. Zero durations disable the corresponding deadline.
#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Deadline for reading one request frame.
    pub read_timeout: Duration,
    /// Deadline for writing one response frame.
    pub write_timeout: Duration,
    /// How long to wait for the next request on a kept-alive connection.
    /// Falls back to `read_timeout` when zero.
    pub idle_timeout: Duration,
    /// Whether connections are kept alive across requests. Defaults to on.
    pub disable_keep_alives: bool,
    /// Metrics instance, if metrics are enabled.
    pub metrics: Option<Arc<ServerMetrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("disable_keep_alives", &self.disable_keep_alives)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_keep_alives_disabled(mut self) -> Self {
        self.disable_keep_alives = true;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ServerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Keep-alive wait for the next request; the read deadline doubles as
    /// the idle limit when no explicit idle timeout is set.
    pub fn effective_idle_timeout(&self) -> Duration {
        if self.idle_timeout.is_zero() {
            self.read_timeout
        } else {
            self.idle_timeout
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// A bound listener, TCP or VSOCK.
pub enum Listener {
    Tcp(TcpListener),
    Vsock(VsockListener),
}

impl Listener {
    /// Binds to the address, dispatching on the variant.
    pub async fn bind(addr: &Address) -> Result<Self, ServerError> {
        match addr {
            Address::Tcp { ip, port } => {
                let port = u16::try_from(*port).map_err(|_| {
                    ServerError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "tcp port out of range",
                    ))
                })?;
                let listener = TcpListener::bind((ip.as_str(), port)).await?;
                Ok(Listener::Tcp(listener))
            }
            Address::Vsock { context_id, port } => {
                let listener = VsockListener::bind(VsockAddr::new(*context_id, *port))?;
                Ok(Listener::Vsock(listener))
            }
        }
    }

    /// The bound local port, useful when binding port zero.
    pub fn local_port(&self) -> io::Result<u32> {
        match self {
            Listener::Tcp(listener) => Ok(listener.local_addr()?.port() as u32),
            Listener::Vsock(listener) => Ok(listener.local_addr()?.port()),
        }
    }

    async fn accept(&mut self) -> io::Result<(ServerStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true).ok();
                Ok((ServerStream::Tcp { stream }, peer.to_string()))
            }
            Listener::Vsock(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((
                    ServerStream::Vsock { stream },
                    format!("{}:{}", peer.cid(), peer.port()),
                ))
            }
        }
    }
}

/// RPC server over TCP or VSOCK.
pub struct Server {
    addr: Address,
    config: ServerConfig,
    handlers: Arc<HandlerRegistry>,
    keep_alive: Arc<AtomicBool>,
    conn_index: AtomicI64,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    pub fn new(addr: Address, config: ServerConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            keep_alive: Arc::new(AtomicBool::new(!config.disable_keep_alives)),
            addr,
            config,
            handlers: Arc::new(HandlerRegistry::default()),
            conn_index: AtomicI64::new(0),
            stats: Arc::new(ServerStats::default()),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Registers `handler` for requests addressed to `path`.
    pub fn handle_func<F>(&self, path: impl Into<String>, handler: F)
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, HandlerError> + Send + Sync + 'static,
    {
        self.handlers.register(path, Arc::new(handler) as Handler);
    }

    /// Toggles keep-alive for connections accepted from now on and for
    /// existing connections at their next response.
    pub fn set_keep_alives_enabled(&self, enabled: bool) {
        self.keep_alive.store(enabled, Ordering::Relaxed);
    }

    /// Binds the configured address.
    pub async fn listen(&self) -> Result<Listener, ServerError> {
        Listener::bind(&self.addr).await
    }

    /// Binds and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.listen().await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener`, spawning one serve task per
    /// connection, until shutdown. Transient accept failures back off
    /// exponentially instead of killing the loop.
    pub async fn serve(&self, mut listener: Listener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(addr = %self.addr, "server listening");

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut accept_delay = Duration::ZERO;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            accept_delay = Duration::ZERO;
                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            if let Some(metrics) = &self.config.metrics {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let conn = Conn::new(
                                self.next_conn_name(),
                                remote,
                                self.config.clone(),
                                Arc::clone(&self.handlers),
                                Arc::clone(&self.stats),
                                Arc::clone(&self.keep_alive),
                            );
                            let shutdown = self.shutdown.subscribe();
                            tokio::spawn(conn.serve(stream, shutdown));
                        }
                        Err(err) => {
                            accept_delay = next_accept_delay(accept_delay);
                            tracing::error!(
                                error = %err,
                                delay_ms = accept_delay.as_millis() as u64,
                                "accept failed"
                            );
                            tokio::time::sleep(accept_delay).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Initiates shutdown: the accept loop stops and kept-alive connections
    /// terminate at their next wait.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    fn next_conn_name(&self) -> i64 {
        self.conn_index.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn next_accept_delay(current: Duration) -> Duration {
    const MAX_DELAY: Duration = Duration::from_secs(1);
    if current.is_zero() {
        Duration::from_millis(5)
    } else {
        (current * 2).min(MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert!(config.read_timeout.is_zero());
        assert!(config.idle_timeout.is_zero());
        assert!(!config.disable_keep_alives);
        assert!(config.metrics.is_none());
    }

    #[test]
    fn test_effective_idle_timeout_falls_back_to_read_timeout() {
        let config = ServerConfig::new().with_read_timeout(Duration::from_secs(2));
        assert_eq!(config.effective_idle_timeout(), Duration::from_secs(2));

        let config = config.with_idle_timeout(Duration::from_secs(10));
        assert_eq!(config.effective_idle_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_accept_backoff_doubles_and_caps() {
        let mut delay = Duration::ZERO;
        delay = next_accept_delay(delay);
        assert_eq!(delay, Duration::from_millis(5));
        delay = next_accept_delay(delay);
        assert_eq!(delay, Duration::from_millis(10));
        for _ in 0..16 {
            delay = next_accept_delay(delay);
        }
        assert_eq!(delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_server_not_running_before_serve() {
        let server = Server::new(Address::tcp("127.0.0.1", 0), ServerConfig::default());
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_listener_reports_ephemeral_port() {
        let server = Server::new(Address::tcp("127.0.0.1", 0), ServerConfig::default());
        let listener = server.listen().await.unwrap();
        assert!(listener.local_port().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_serve() {
        let server = Arc::new(Server::new(
            Address::tcp("127.0.0.1", 0),
            ServerConfig::default(),
        ));
        let listener = server.listen().await.unwrap();

        let serve = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(listener).await }
        });

        // Let the loop start before asking it to stop.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.is_running());
        server.shutdown();

        tokio::time::timeout(Duration::from_secs(1), serve)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!server.is_running());
    }
}
